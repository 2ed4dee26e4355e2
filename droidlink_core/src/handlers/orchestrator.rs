//! Mesh orchestration endpoints
//!
//! Wraps the outbound [`Orchestrator`] client: peer probing, dispatch,
//! broadcast fan-out and device-to-device transfer coordination. For a
//! transfer this agent either initiates (telling the source peer to
//! export and push) or, when addressed with `role: "source"`, performs
//! the export and pushes the result to the target's transfer port.

use super::{contacts::to_vcf, json_body, ApiError, HandlerResult};
use crate::http::{Request, Response};
use crate::lifecycle::Counters;
use crate::orchestrator::Orchestrator;
use crate::pairing::{now_ms, PairingStore};
use crate::providers::Providers;
use crate::transfer::{ClientAuth, TransferClient, DEFAULT_TRANSFER_PORT};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub struct OrchestratorHandler {
    orchestrator: Arc<Orchestrator>,
    store: Arc<PairingStore>,
    counters: Arc<Counters>,
    providers: Providers,
}

#[derive(Deserialize)]
struct DispatchBody {
    target_device_id: String,
    method: String,
    endpoint: String,
    body: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct BroadcastBody {
    method: String,
    endpoint: String,
    body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransferBody {
    #[serde(default)]
    source_device_id: Option<String>,
    target_device_id: String,
    data_type: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Deserialize)]
struct SyncBody {
    data_type: String,
    device_ids: Option<Vec<String>>,
    direction: Option<String>,
    #[serde(default)]
    source_device_id: Option<String>,
}

#[derive(Deserialize)]
struct DeployBody {
    target_device_id: String,
}

impl OrchestratorHandler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<PairingStore>,
        counters: Arc<Counters>,
        providers: Providers,
    ) -> Self {
        Self {
            orchestrator,
            store,
            counters,
            providers,
        }
    }

    pub async fn handle(&self, action: &str, request: &Request) -> HandlerResult {
        match action {
            "topology" => Ok(Response::ok_json(self.orchestrator.topology().await)),
            "dispatch" => {
                let body: DispatchBody = json_body(request)?;
                let result = self
                    .orchestrator
                    .dispatch(
                        &body.target_device_id,
                        &body.method,
                        &body.endpoint,
                        body.body.as_ref(),
                    )
                    .await?;
                Ok(Response::ok_json(result))
            }
            "broadcast" => {
                let body: BroadcastBody = json_body(request)?;
                let result = self
                    .orchestrator
                    .broadcast(&body.method, &body.endpoint, body.body.as_ref())
                    .await;
                Ok(Response::ok_json(result))
            }
            "transfer" => {
                let body: TransferBody = json_body(request)?;
                self.transfer(body).await
            }
            "deploy-toolkit" => {
                let body: DeployBody = json_body(request)?;
                Ok(Response::ok_json(
                    self.orchestrator.deploy_steps(&body.target_device_id)?,
                ))
            }
            "status" => {
                let mut status = self.counters.snapshot();
                status["status"] = serde_json::json!("ok");
                status["paired_devices"] = serde_json::json!(self.store.count());
                status["version"] = serde_json::json!(env!("CARGO_PKG_VERSION"));
                Ok(Response::ok_json(status))
            }
            "sync" => {
                let body: SyncBody = json_body(request)?;
                self.sync(body).await
            }
            _ => Err(ApiError::NotFound(format!(
                "unknown orchestrator action '{}'",
                action
            ))),
        }
    }

    async fn transfer(&self, body: TransferBody) -> HandlerResult {
        if body.role.as_deref() == Some("source") {
            return self.run_as_source(&body).await;
        }

        let source_id = body
            .source_device_id
            .clone()
            .unwrap_or_else(|| self.store.device_id().to_string());

        // This agent is the source itself: no extra hop needed
        if source_id == self.store.device_id() {
            return self.run_as_source(&body).await;
        }

        // Tell the source peer to export and push to the target
        let mut forwarded = body.clone();
        forwarded.role = Some("source".to_string());
        if forwarded.params.get("target_address").is_none() {
            let params = std::mem::take(&mut forwarded.params);
            forwarded.params = self.with_target_address(params, &body.target_device_id)?;
        }

        let result = self
            .orchestrator
            .dispatch(
                &source_id,
                "POST",
                "/api/orchestrator/transfer",
                Some(&serde_json::to_value(&forwarded).map_err(|e| {
                    ApiError::Internal(format!("transfer serialization failed: {}", e))
                })?),
            )
            .await?;

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "initiated": true,
            "source": source_id,
            "target": body.target_device_id,
            "result": result,
        })))
    }

    /// Fill `target_address` from the pairing record: same host as the
    /// peer's HTTP endpoint, transfer port
    fn with_target_address(
        &self,
        mut params: serde_json::Value,
        target_id: &str,
    ) -> Result<serde_json::Value, ApiError> {
        let target = self
            .store
            .get(target_id)
            .ok_or_else(|| ApiError::NotFound(format!("unknown peer {}", target_id)))?;
        if target.last_address.is_empty() {
            return Err(ApiError::BadRequest(format!(
                "no known address for peer {}",
                target_id
            )));
        }

        let host = target
            .last_address
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(target.last_address.as_str());
        let port = params
            .get("target_port")
            .and_then(|p| p.as_u64())
            .unwrap_or(DEFAULT_TRANSFER_PORT as u64);

        if !params.is_object() {
            params = serde_json::json!({});
        }
        params["target_address"] = serde_json::json!(format!("{}:{}", host, port));
        Ok(params)
    }

    /// Export the requested data and push it to the target peer
    async fn run_as_source(&self, body: &TransferBody) -> HandlerResult {
        let target = self
            .store
            .get(&body.target_device_id)
            .ok_or_else(|| {
                ApiError::NotFound(format!("unknown peer {}", body.target_device_id))
            })?;

        let target_address = match body.params.get("target_address").and_then(|a| a.as_str()) {
            Some(addr) => addr.to_string(),
            None => {
                let params = self.with_target_address(body.params.clone(), &target.peer_id)?;
                params["target_address"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string()
            }
        };

        let (local_path, remote_path, cleanup) = self.export_payload(body)?;

        let secret = target
            .secret_bytes()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let client = TransferClient::new(
            &target_address,
            ClientAuth::Peer {
                local_device_id: self.store.device_id().to_string(),
                secret,
            },
        );

        info!(
            "Pushing {} export to {} at {}",
            body.data_type, target.peer_id, target_address
        );
        let reply = client.push(&local_path, &remote_path).await;

        if cleanup {
            let _ = std::fs::remove_file(&local_path);
        }

        let reply = reply.map_err(|e| ApiError::Internal(format!("push failed: {}", e)))?;
        Ok(Response::ok_json(serde_json::json!({
            "status": reply.status.clone().unwrap_or_else(|| "ok".to_string()),
            "target": target.peer_id,
            "remote_path": remote_path,
            "bytes": reply.bytes_written,
            "sha256": reply.sha256,
        })))
    }

    /// Materialize the export for a transfer. Returns the local file,
    /// the remote path to push to, and whether the local file is a
    /// temporary that should be removed afterwards.
    fn export_payload(
        &self,
        body: &TransferBody,
    ) -> Result<(std::path::PathBuf, String, bool), ApiError> {
        let stamp = now_ms();
        match body.data_type.as_str() {
            "contacts" => {
                let contacts = self.providers.contacts.list()?;
                let path = std::env::temp_dir().join(format!("droidlink-contacts-{}.vcf", stamp));
                std::fs::write(&path, to_vcf(&contacts))?;
                Ok((path, format!("inbox/contacts-{}.vcf", stamp), true))
            }
            "sms" => {
                let messages = self.providers.sms.all()?;
                let path = std::env::temp_dir().join(format!("droidlink-sms-{}.json", stamp));
                std::fs::write(
                    &path,
                    serde_json::to_vec(&serde_json::json!({ "messages": messages }))
                        .map_err(|e| ApiError::Internal(e.to_string()))?,
                )?;
                Ok((path, format!("inbox/sms-{}.json", stamp), true))
            }
            "files" => {
                let raw = body
                    .params
                    .get("path")
                    .and_then(|p| p.as_str())
                    .ok_or_else(|| {
                        ApiError::BadRequest("file transfer requires params.path".to_string())
                    })?;
                let local = self.providers.files.resolve(raw)?;
                let name = local
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "payload.bin".to_string());
                let remote = body
                    .params
                    .get("remote_path")
                    .and_then(|p| p.as_str())
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| format!("inbox/{}", name));
                Ok((local, remote, false))
            }
            other => Err(ApiError::BadRequest(format!(
                "unknown data_type '{}'",
                other
            ))),
        }
    }

    /// Fan a transfer out across the mesh: one export-and-push per
    /// target, every target reported even when it fails.
    async fn sync(&self, body: SyncBody) -> HandlerResult {
        let direction = body.direction.as_deref().unwrap_or("source_to_targets");
        if direction != "source_to_targets" {
            return Err(ApiError::BadRequest(format!(
                "unknown direction '{}'",
                direction
            )));
        }

        let source_id = body
            .source_device_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.store.device_id().to_string());

        let wildcard = body
            .device_ids
            .as_ref()
            .map(|ids| ids.iter().any(|id| id == "*"))
            .unwrap_or(true);
        let targets: Vec<String> = if wildcard {
            self.store
                .list()
                .into_iter()
                .filter(|p| p.trusted && p.peer_id != source_id)
                .map(|p| p.peer_id)
                .collect()
        } else {
            body.device_ids.clone().unwrap_or_default()
        };

        if targets.is_empty() {
            return Err(ApiError::BadRequest("no sync targets".to_string()));
        }

        let mut results = serde_json::Map::new();
        for target_id in targets {
            let transfer = TransferBody {
                source_device_id: Some(source_id.clone()),
                target_device_id: target_id.clone(),
                data_type: body.data_type.clone(),
                params: serde_json::json!({}),
                role: None,
            };
            let outcome = match self.transfer(transfer).await {
                Ok(response) => match response.body {
                    crate::http::Body::Bytes(bytes) => {
                        serde_json::from_slice(&bytes).unwrap_or_default()
                    }
                    _ => serde_json::json!({ "status": "ok" }),
                },
                Err(e) => serde_json::json!({ "error": e.message() }),
            };
            results.insert(target_id, outcome);
        }

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "data_type": body.data_type,
            "source": source_id,
            "results": results,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::host_providers;
    use crate::http::Body;
    use tempfile::TempDir;

    fn handler() -> (TempDir, OrchestratorHandler) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PairingStore::open(dir.path().join("state.json")).unwrap());
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store)));
        let counters = Arc::new(Counters::default());
        let providers = host_providers(Some(dir.path().to_path_buf()));

        (
            dir,
            OrchestratorHandler::new(orchestrator, store, counters, providers),
        )
    }

    fn body_json(response: Response) -> serde_json::Value {
        match response.body {
            Body::Bytes(bytes) => serde_json::from_slice(&bytes).unwrap(),
            _ => panic!("expected bytes body"),
        }
    }

    #[tokio::test]
    async fn test_topology_with_no_peers() {
        let (_dir, handler) = handler();
        let request = Request::test("GET", "/api/orchestrator/topology");
        let value = body_json(handler.handle("topology", &request).await.unwrap());
        assert_eq!(value["count"], 0);
    }

    #[tokio::test]
    async fn test_status_reports_counters() {
        let (_dir, handler) = handler();
        handler.counters.add_bytes(512);

        let request = Request::test("GET", "/api/orchestrator/status");
        let value = body_json(handler.handle("status", &request).await.unwrap());
        assert_eq!(value["total_bytes_transferred"], 512);
        assert_eq!(value["paired_devices"], 0);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_peer_is_404() {
        let (_dir, handler) = handler();
        let mut request = Request::test("POST", "/api/orchestrator/dispatch");
        request.body = serde_json::json!({
            "target_device_id": "ghost",
            "method": "GET",
            "endpoint": "/api/ping",
        })
        .to_string()
        .into_bytes();

        assert_eq!(
            handler.handle("dispatch", &request).await.unwrap_err().status(),
            404
        );
    }

    #[tokio::test]
    async fn test_transfer_unknown_data_type_is_400() {
        let (_dir, handler) = handler();
        // Register a peer so the target lookup passes first
        let peer = crate::crypto::KeyPair::generate();
        let pending = handler
            .store
            .create_pending("peer-t", "T", &peer.public_key_b64(), "127.0.0.1:15555")
            .unwrap();
        handler.store.approve(&pending.challenge_id).unwrap();

        let mut request = Request::test("POST", "/api/orchestrator/transfer");
        request.body = serde_json::json!({
            "target_device_id": "peer-t",
            "data_type": "playlists",
            "role": "source",
        })
        .to_string()
        .into_bytes();

        assert_eq!(
            handler.handle("transfer", &request).await.unwrap_err().status(),
            400
        );
    }

    #[tokio::test]
    async fn test_sync_without_targets_is_400() {
        let (_dir, handler) = handler();
        let mut request = Request::test("POST", "/api/orchestrator/sync");
        request.body = serde_json::json!({ "data_type": "contacts" })
            .to_string()
            .into_bytes();

        assert_eq!(
            handler.handle("sync", &request).await.unwrap_err().status(),
            400
        );
    }

    #[tokio::test]
    async fn test_deploy_toolkit_plan() {
        let (_dir, handler) = handler();
        let peer = crate::crypto::KeyPair::generate();
        let pending = handler
            .store
            .create_pending("peer-d", "D", &peer.public_key_b64(), "10.0.0.5:15555")
            .unwrap();
        handler.store.approve(&pending.challenge_id).unwrap();

        let mut request = Request::test("POST", "/api/orchestrator/deploy-toolkit");
        request.body = serde_json::json!({ "target_device_id": "peer-d" })
            .to_string()
            .into_bytes();

        let value = body_json(handler.handle("deploy-toolkit", &request).await.unwrap());
        assert_eq!(value["steps"].as_array().unwrap().len(), 3);
    }
}
