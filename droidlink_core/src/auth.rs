//! Request authentication
//!
//! Two schemes are evaluated per request: the controller token
//! (`X-Agent-Token` header or `token` query parameter) and the peer
//! HMAC triple (`X-Peer-Id`, `X-Peer-Signature`, `X-Peer-Timestamp`).
//! Peer signatures cover `METHOD|uri|timestamp` and are only valid
//! within the replay window.

use crate::crypto;
use crate::http::Request;
use crate::pairing::{now_ms, PairingStore};
use std::sync::{Arc, RwLock};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Accepted clock skew for peer signatures
pub const REPLAY_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Who a request was authenticated as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Carried the configured controller token
    Controller,
    /// Carried a valid peer signature from this device id
    Peer(String),
    /// Loopback caller on a fresh install with no token configured
    Open,
}

impl Verdict {
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Verdict::Peer(id) => Some(id),
            _ => None,
        }
    }
}

/// Authentication failure, carrying its HTTP status
#[derive(Debug, Error)]
pub enum AuthFailure {
    /// Headers present but unparseable (400)
    #[error("{0}")]
    Malformed(String),
    /// Token missing or wrong (401)
    #[error("{0}")]
    Unauthenticated(String),
    /// Peer signature invalid, stale or from an unknown peer (403)
    #[error("{0}")]
    Forbidden(String),
}

impl AuthFailure {
    pub fn status(&self) -> u16 {
        match self {
            AuthFailure::Malformed(_) => 400,
            AuthFailure::Unauthenticated(_) => 401,
            AuthFailure::Forbidden(_) => 403,
        }
    }
}

/// Evaluates both authentication schemes against the pairing store and
/// the process-wide controller token.
pub struct AuthGate {
    token: Arc<RwLock<String>>,
    store: Arc<PairingStore>,
}

impl AuthGate {
    pub fn new(token: Arc<RwLock<String>>, store: Arc<PairingStore>) -> Self {
        Self { token, store }
    }

    pub fn token(&self) -> String {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Authenticate a request under the default policy: peer HMAC takes
    /// precedence when its headers are present, otherwise the token
    /// scheme applies.
    pub fn verify(&self, request: &Request) -> Result<Verdict, AuthFailure> {
        let peer_id = request.header("x-peer-id");
        let signature = request.header("x-peer-signature");
        let timestamp = request.header("x-peer-timestamp");

        match (peer_id, signature, timestamp) {
            (Some(peer_id), Some(signature), Some(timestamp)) => {
                let id = self.verify_peer_sig(
                    peer_id,
                    timestamp,
                    signature,
                    &request.method,
                    &request.target,
                )?;
                Ok(Verdict::Peer(id))
            }
            (None, None, None) => {
                let supplied = request
                    .header("x-agent-token")
                    .or_else(|| request.query_param("token"));
                self.verify_token(supplied, request.is_loopback())
            }
            _ => Err(AuthFailure::Malformed(
                "incomplete peer authentication headers".to_string(),
            )),
        }
    }

    /// Authenticate a request that must carry a valid peer signature
    /// (the P2P data plane).
    pub fn verify_peer(&self, request: &Request) -> Result<String, AuthFailure> {
        let peer_id = request
            .header("x-peer-id")
            .ok_or_else(|| AuthFailure::Forbidden("peer authentication required".to_string()))?;
        let signature = request
            .header("x-peer-signature")
            .ok_or_else(|| AuthFailure::Forbidden("peer authentication required".to_string()))?;
        let timestamp = request
            .header("x-peer-timestamp")
            .ok_or_else(|| AuthFailure::Forbidden("peer authentication required".to_string()))?;

        self.verify_peer_sig(peer_id, timestamp, signature, &request.method, &request.target)
    }

    /// Validate a peer signature over `prefix|uri|timestamp`.
    ///
    /// The HTTP path passes the method and the exact path-and-query;
    /// the transfer channel passes the frame op and path.
    pub fn verify_peer_sig(
        &self,
        peer_id: &str,
        timestamp: &str,
        signature: &str,
        prefix: &str,
        uri: &str,
    ) -> Result<String, AuthFailure> {
        let ts: u64 = timestamp
            .parse()
            .map_err(|_| AuthFailure::Malformed("invalid peer timestamp".to_string()))?;

        let now = now_ms();
        if now.abs_diff(ts) > REPLAY_WINDOW_MS {
            return Err(AuthFailure::Forbidden("signature timestamp expired".to_string()));
        }

        let device = self
            .store
            .get(peer_id)
            .ok_or_else(|| AuthFailure::Forbidden("unknown peer".to_string()))?;
        if !device.trusted {
            return Err(AuthFailure::Forbidden("peer not trusted".to_string()));
        }

        let secret = device
            .secret_bytes()
            .map_err(|_| AuthFailure::Forbidden("pairing record unusable".to_string()))?;

        let message = format!("{}|{}|{}", prefix, uri, timestamp);
        if !crypto::hmac_verify(&secret, &message, signature) {
            return Err(AuthFailure::Forbidden("HMAC verification failed".to_string()));
        }

        self.store.touch_seen(peer_id);
        Ok(peer_id.to_string())
    }

    /// Validate the controller token. An empty configured token admits
    /// loopback callers only (fresh-install escape hatch).
    pub fn verify_token(
        &self,
        supplied: Option<&str>,
        loopback: bool,
    ) -> Result<Verdict, AuthFailure> {
        let configured = self.token();

        if configured.is_empty() {
            if loopback {
                return Ok(Verdict::Open);
            }
            return Err(AuthFailure::Unauthenticated(
                "no token configured; remote access denied".to_string(),
            ));
        }

        match supplied {
            Some(supplied)
                if bool::from(supplied.as_bytes().ct_eq(configured.as_bytes())) =>
            {
                Ok(Verdict::Controller)
            }
            Some(_) => Err(AuthFailure::Unauthenticated("invalid token".to_string())),
            None => Err(AuthFailure::Unauthenticated("missing token".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::pairing::PairingStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        gate: AuthGate,
        store: Arc<PairingStore>,
        peer: KeyPair,
        peer_id: String,
    }

    fn fixture(token: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PairingStore::open(dir.path().join("pairing_state.json")).unwrap());
        let peer = KeyPair::generate();

        let pending = store
            .create_pending("peer-a", "Phone A", &peer.public_key_b64(), "")
            .unwrap();
        store.approve(&pending.challenge_id).unwrap();

        let gate = AuthGate::new(
            Arc::new(RwLock::new(token.to_string())),
            Arc::clone(&store),
        );

        Fixture {
            _dir: dir,
            gate,
            store,
            peer,
            peer_id: "peer-a".to_string(),
        }
    }

    fn signed_request(fx: &Fixture, method: &str, target: &str, ts: u64) -> Request {
        let secret = fx.peer.shared_secret(&fx.store.public_key_b64()).unwrap();
        let message = format!("{}|{}|{}", method, target, ts);
        let signature = crypto::hmac_sign(&secret, &message).unwrap();

        let mut request = Request::test(method, target);
        request.headers.insert("x-peer-id".into(), fx.peer_id.clone());
        request.headers.insert("x-peer-timestamp".into(), ts.to_string());
        request.headers.insert("x-peer-signature".into(), signature);
        request
    }

    #[test]
    fn test_token_accepted() {
        let fx = fixture("sekrit");
        let mut request = Request::test("GET", "/api/files/list?path=/");
        request
            .headers
            .insert("x-agent-token".into(), "sekrit".into());

        assert_eq!(fx.gate.verify(&request).unwrap(), Verdict::Controller);
    }

    #[test]
    fn test_token_via_query_param() {
        let fx = fixture("sekrit");
        let request = Request::test("GET", "/api/files/list?token=sekrit");
        assert_eq!(fx.gate.verify(&request).unwrap(), Verdict::Controller);
    }

    #[test]
    fn test_missing_token_is_401() {
        let fx = fixture("sekrit");
        let request = Request::test("GET", "/api/files/list");
        let failure = fx.gate.verify(&request).unwrap_err();
        assert_eq!(failure.status(), 401);
    }

    #[test]
    fn test_wrong_token_is_401() {
        let fx = fixture("sekrit");
        let mut request = Request::test("GET", "/api/files/list");
        request.headers.insert("x-agent-token".into(), "nope".into());
        assert_eq!(fx.gate.verify(&request).unwrap_err().status(), 401);
    }

    #[test]
    fn test_empty_token_admits_loopback_only() {
        let fx = fixture("");
        let request = Request::test("GET", "/api/files/list");
        assert_eq!(fx.gate.verify(&request).unwrap(), Verdict::Open);

        let mut remote = Request::test("GET", "/api/files/list");
        remote.peer_addr = "192.168.1.20:55555".parse().unwrap();
        assert_eq!(fx.gate.verify(&remote).unwrap_err().status(), 401);
    }

    #[test]
    fn test_valid_peer_signature() {
        let fx = fixture("sekrit");
        let request = signed_request(&fx, "GET", "/api/ping", now_ms());
        assert_eq!(
            fx.gate.verify(&request).unwrap(),
            Verdict::Peer("peer-a".to_string())
        );
    }

    #[test]
    fn test_peer_signature_marks_last_seen() {
        let fx = fixture("sekrit");
        let before = fx.store.get("peer-a").unwrap().last_seen;
        std::thread::sleep(std::time::Duration::from_millis(5));

        let request = signed_request(&fx, "GET", "/api/ping", now_ms());
        fx.gate.verify(&request).unwrap();

        assert!(fx.store.get("peer-a").unwrap().last_seen >= before);
    }

    #[test]
    fn test_stale_timestamp_is_403() {
        let fx = fixture("sekrit");
        let request = signed_request(&fx, "GET", "/api/ping", now_ms() - 10 * 60 * 1000);
        let failure = fx.gate.verify(&request).unwrap_err();
        assert_eq!(failure.status(), 403);
        assert!(failure.to_string().contains("expired"));
    }

    #[test]
    fn test_tampered_signature_is_403() {
        let fx = fixture("sekrit");
        let mut request = signed_request(&fx, "GET", "/api/ping", now_ms());
        let sig = request.headers.get_mut("x-peer-signature").unwrap();
        let flipped = if sig.ends_with('0') { "1" } else { "0" };
        sig.truncate(sig.len() - 1);
        sig.push_str(flipped);

        let failure = fx.gate.verify(&request).unwrap_err();
        assert_eq!(failure.status(), 403);
        assert!(failure.to_string().contains("HMAC"));
    }

    #[test]
    fn test_signature_covers_exact_target() {
        let fx = fixture("sekrit");
        let mut request = signed_request(&fx, "GET", "/api/ping", now_ms());
        // Re-point the signed request at another endpoint
        request.target = "/api/files/list".to_string();
        assert_eq!(fx.gate.verify(&request).unwrap_err().status(), 403);
    }

    #[test]
    fn test_unknown_peer_is_403() {
        let fx = fixture("sekrit");
        let mut request = signed_request(&fx, "GET", "/api/ping", now_ms());
        request
            .headers
            .insert("x-peer-id".into(), "stranger".into());
        assert_eq!(fx.gate.verify(&request).unwrap_err().status(), 403);
    }

    #[test]
    fn test_incomplete_peer_headers_is_400() {
        let fx = fixture("sekrit");
        let mut request = Request::test("GET", "/api/ping");
        request.headers.insert("x-peer-id".into(), "peer-a".into());
        assert_eq!(fx.gate.verify(&request).unwrap_err().status(), 400);
    }

    #[test]
    fn test_garbage_timestamp_is_400() {
        let fx = fixture("sekrit");
        let mut request = signed_request(&fx, "GET", "/api/ping", now_ms());
        request
            .headers
            .insert("x-peer-timestamp".into(), "yesterday".into());
        assert_eq!(fx.gate.verify(&request).unwrap_err().status(), 400);
    }

    #[test]
    fn test_verify_peer_requires_headers() {
        let fx = fixture("sekrit");
        let request = Request::test("POST", "/api/peer/send");
        assert_eq!(fx.gate.verify_peer(&request).unwrap_err().status(), 403);
    }
}
