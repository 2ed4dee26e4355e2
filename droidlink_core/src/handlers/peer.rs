//! Pairing protocol and P2P data-plane endpoints
//!
//! Pairing endpoints are deliberately open: they ARE the
//! authentication step. The data plane (`send`, `request`, `relay`)
//! requires a valid peer signature; `paired` and the revocation
//! endpoints accept either scheme.

use super::{json_body, require_param, ApiError, HandlerResult};
use crate::auth::AuthGate;
use crate::discovery::PeerBrowser;
use crate::http::{Request, Response, DEFAULT_HTTP_PORT};
use crate::pairing::PairingStore;
use crate::providers::{FilesProvider, SecurityDelegate};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

pub struct PeerHandler {
    store: Arc<PairingStore>,
    gate: Arc<AuthGate>,
    security: Arc<dyn SecurityDelegate>,
    files: Arc<dyn FilesProvider>,
    browser: Option<Arc<PeerBrowser>>,
    label: String,
}

#[derive(Deserialize)]
struct PairInitBody {
    device_id: String,
    label: String,
    public_key: String,
    /// HTTP port the initiator listens on, for the address record
    port: Option<u16>,
}

#[derive(Deserialize)]
struct ChallengeBody {
    challenge_id: String,
    #[serde(default)]
    biometric_verified: bool,
}

#[derive(Deserialize)]
struct RevokeBody {
    device_id: String,
    #[serde(default)]
    biometric_verified: bool,
}

#[derive(Deserialize)]
struct RequestBody {
    resource: String,
}

impl PeerHandler {
    pub fn new(
        store: Arc<PairingStore>,
        gate: Arc<AuthGate>,
        security: Arc<dyn SecurityDelegate>,
        files: Arc<dyn FilesProvider>,
        browser: Option<Arc<PeerBrowser>>,
        label: String,
    ) -> Self {
        Self {
            store,
            gate,
            security,
            files,
            browser,
            label,
        }
    }

    pub fn handle(&self, action: &str, request: &Request) -> HandlerResult {
        match action {
            "identity" => self.identity(),
            "discover" => self.discover(),
            "pair-init" => self.pair_init(request),
            "pair-pending" => self.pair_pending(),
            "pair-approve" => self.pair_approve(request),
            "pair-reject" => self.pair_reject(request),
            "paired" => self.paired(request),
            "revoke" => self.revoke(request),
            "revoke-all" => self.revoke_all(request),
            "send" => self.send(request),
            "request" => self.peer_request(request),
            "relay" => {
                // Requires a forwarding hop through a third paired peer.
                // TODO: implement once the relay routing policy is settled;
                // until then this op is explicitly unimplemented.
                Err(ApiError::NotImplemented("relay_not_implemented".to_string()))
            }
            _ => Err(ApiError::NotFound(format!("unknown peer action '{}'", action))),
        }
    }

    fn identity(&self) -> HandlerResult {
        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "device_id": self.store.device_id(),
            "label": self.label,
            "public_key": self.store.public_key_b64(),
            "platform": std::env::consts::OS,
            "version": env!("CARGO_PKG_VERSION"),
        })))
    }

    fn discover(&self) -> HandlerResult {
        let peers = self
            .browser
            .as_ref()
            .map(|b| b.peers())
            .unwrap_or_default();

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "count": peers.len(),
            "peers": peers,
        })))
    }

    fn pair_init(&self, request: &Request) -> HandlerResult {
        if request.method != "POST" {
            return Err(ApiError::BadRequest("pair-init requires POST".to_string()));
        }
        let body: PairInitBody = json_body(request)?;
        if body.device_id.is_empty() || body.public_key.is_empty() {
            return Err(ApiError::BadRequest(
                "device_id and public_key are required".to_string(),
            ));
        }

        // Re-pairing an already-trusted device is a no-op handshake
        if self.store.get(&body.device_id).is_some() {
            return Ok(Response::ok_json(serde_json::json!({
                "status": "already_paired",
                "device_id": self.store.device_id(),
                "public_key": self.store.public_key_b64(),
            })));
        }

        let address = format!(
            "{}:{}",
            request.peer_addr.ip(),
            body.port.unwrap_or(DEFAULT_HTTP_PORT)
        );

        let pending = self
            .store
            .create_pending(&body.device_id, &body.label, &body.public_key, &address)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        info!(
            "Pairing requested by {} ({}), code {}",
            body.label, body.device_id, pending.confirm_code
        );
        self.security.pairing_requested(&pending);

        Ok(Response::ok_json(serde_json::json!({
            "status": "pending_approval",
            "challenge_id": pending.challenge_id,
            "device_id": self.store.device_id(),
            "public_key": self.store.public_key_b64(),
            "confirm_code": pending.confirm_code,
        })))
    }

    fn pair_pending(&self) -> HandlerResult {
        // The confirmation code is only disclosed in the pair-init
        // reply and the local approval UI, never listed afterwards
        let pending: Vec<_> = self
            .store
            .pending_list()
            .into_iter()
            .map(|p| {
                serde_json::json!({
                    "challenge_id": p.challenge_id,
                    "peer_id": p.peer_id,
                    "label": p.label,
                    "address": p.address,
                    "created_at": p.created_at,
                })
            })
            .collect();

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "count": pending.len(),
            "pending": pending,
        })))
    }

    fn pair_approve(&self, request: &Request) -> HandlerResult {
        if request.method != "POST" {
            return Err(ApiError::BadRequest("pair-approve requires POST".to_string()));
        }
        let body: ChallengeBody = json_body(request)?;

        if !body.biometric_verified {
            return Err(ApiError::Forbidden(
                "biometric verification required".to_string(),
            ));
        }
        if !self.security.device_secure() {
            warn!("Pairing approval refused: device has no screen lock");
            return Err(ApiError::Forbidden(
                "device has no screen lock".to_string(),
            ));
        }

        let device = self
            .store
            .approve(&body.challenge_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .ok_or_else(|| {
                ApiError::NotFound("unknown or expired challenge".to_string())
            })?;

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "device_id": self.store.device_id(),
            "public_key": self.store.public_key_b64(),
            "device": device.summary(),
        })))
    }

    fn pair_reject(&self, request: &Request) -> HandlerResult {
        if request.method != "POST" {
            return Err(ApiError::BadRequest("pair-reject requires POST".to_string()));
        }
        let body: ChallengeBody = json_body(request)?;
        let removed = self.store.reject(&body.challenge_id);

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "removed": removed,
        })))
    }

    fn paired(&self, request: &Request) -> HandlerResult {
        self.gate.verify(request)?;

        let devices: Vec<_> = self.store.list().iter().map(|d| d.summary()).collect();
        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "count": devices.len(),
            "devices": devices,
        })))
    }

    fn revoke(&self, request: &Request) -> HandlerResult {
        self.gate.verify(request)?;
        let body: RevokeBody = json_body(request)?;
        if !body.biometric_verified {
            return Err(ApiError::Forbidden(
                "biometric verification required".to_string(),
            ));
        }

        let removed = self
            .store
            .revoke(&body.device_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        if !removed {
            return Err(ApiError::NotFound("unknown peer".to_string()));
        }

        Ok(Response::ok_json(serde_json::json!({ "status": "ok" })))
    }

    fn revoke_all(&self, request: &Request) -> HandlerResult {
        self.gate.verify(request)?;

        let biometric = request
            .json::<serde_json::Value>()
            .ok()
            .and_then(|v| v["biometric_verified"].as_bool())
            .unwrap_or(false);
        if !biometric {
            return Err(ApiError::Forbidden(
                "biometric verification required".to_string(),
            ));
        }

        let removed = self
            .store
            .revoke_all()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "revoked": removed,
        })))
    }

    /// HMAC-only: a paired peer streams a body into a named path
    fn send(&self, request: &Request) -> HandlerResult {
        let peer_id = self.gate.verify_peer(request)?;
        let raw_path = require_param(request, "path")?;
        let target = self.files.resolve(raw_path)?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let written = match &request.body_file {
            Some(spooled) => std::fs::copy(spooled, &target)?,
            None => {
                std::fs::write(&target, &request.body)?;
                request.body.len() as u64
            }
        };

        info!("Peer {} sent {} bytes to {}", peer_id, written, target.display());
        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "path": target.to_string_lossy(),
            "written": written,
        })))
    }

    /// HMAC-only structured query
    fn peer_request(&self, request: &Request) -> HandlerResult {
        self.gate.verify_peer(request)?;
        let body: RequestBody = json_body(request)?;

        match body.resource.as_str() {
            "identity" => self.identity(),
            "paired" => {
                let devices: Vec<_> = self.store.list().iter().map(|d| d.summary()).collect();
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "devices": devices,
                })))
            }
            "storage" => {
                let volumes = self.files.storage()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "volumes": volumes,
                })))
            }
            other => Err(ApiError::BadRequest(format!("unknown resource '{}'", other))),
        }
    }
}
