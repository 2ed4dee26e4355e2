//! Outbound signed requests to paired peers
//!
//! The orchestrator is the client-side mirror of the auth gate: it
//! builds raw HTTP/1.1 requests over TCP, stamps them with the peer
//! signature headers and aggregates fan-out results. Failures become
//! structured entries, never crashes.

use crate::error::{AgentError, Result};
use crate::http::DEFAULT_HTTP_PORT;
use crate::pairing::{now_ms, PairedDevice, PairingStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::debug;

/// Default per-request timeout for peer calls
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// A parsed peer reply
#[derive(Debug, Clone)]
pub struct HttpAnswer {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpAnswer {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as JSON, wrapping non-JSON payloads
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or_else(|_| {
            serde_json::json!({ "raw": String::from_utf8_lossy(&self.body) })
        })
    }
}

/// One-shot HTTP/1.1 exchange over a fresh TCP connection.
///
/// The agent's own surface speaks `Connection: close`, so the reply
/// body is simply everything after the header section.
pub async fn http_request(
    addr: &str,
    method: &str,
    target: &str,
    headers: &[(String, String)],
    body: Option<&[u8]>,
    timeout: Duration,
) -> Result<HttpAnswer> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;

        let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", method, target, addr);
        for (name, value) in headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!(
            "Content-Length: {}\r\n\r\n",
            body.map(|b| b.len()).unwrap_or(0)
        ));

        stream.write_all(head.as_bytes()).await?;
        if let Some(body) = body {
            stream.write_all(body).await?;
        }
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| AgentError::Network(format!("bad status line: {}", status_line.trim())))?;

        // Skip headers
        let mut line = String::new();
        loop {
            line.clear();
            reader.read_line(&mut line).await?;
            if line.trim_end_matches(['\r', '\n']).is_empty() {
                break;
            }
        }

        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;

        Ok(HttpAnswer { status, body })
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| AgentError::Timeout(format!("request to {} timed out", addr)))?
}

/// Normalize a stored peer address to `host:port`
fn peer_http_addr(peer: &PairedDevice) -> Result<String> {
    if peer.last_address.is_empty() {
        return Err(AgentError::Network(format!(
            "no known address for peer {}",
            peer.peer_id
        )));
    }
    if peer.last_address.contains(':') {
        Ok(peer.last_address.clone())
    } else {
        Ok(format!("{}:{}", peer.last_address, DEFAULT_HTTP_PORT))
    }
}

pub struct Orchestrator {
    store: Arc<PairingStore>,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(store: Arc<PairingStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_PEER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one signed request to a paired peer
    pub async fn signed_request(
        &self,
        peer: &PairedDevice,
        method: &str,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<HttpAnswer> {
        let addr = peer_http_addr(peer)?;
        let timestamp = now_ms().to_string();
        let message = format!("{}|{}|{}", method, endpoint, timestamp);
        let signature = self.store.sign_for(&peer.peer_id, &message)?;

        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("X-Peer-Id".to_string(), self.store.device_id().to_string()),
            ("X-Peer-Timestamp".to_string(), timestamp),
            ("X-Peer-Signature".to_string(), signature),
        ];

        let body_bytes = body.map(|v| v.to_string().into_bytes());
        debug!("Peer request {} {} -> {}", method, endpoint, addr);

        http_request(
            &addr,
            method,
            endpoint,
            &headers,
            body_bytes.as_deref(),
            self.timeout,
        )
        .await
    }

    /// Send to a peer by id; unknown ids are an error
    pub async fn dispatch(
        &self,
        target_id: &str,
        method: &str,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let peer = self
            .store
            .get(target_id)
            .ok_or_else(|| AgentError::NotFound(format!("unknown peer {}", target_id)))?;

        let answer = self.signed_request(&peer, method, endpoint, body).await?;
        Ok(serde_json::json!({
            "peer_id": peer.peer_id,
            "status": answer.status,
            "body": answer.json(),
        }))
    }

    /// Probe every paired peer in parallel
    pub async fn topology(&self) -> serde_json::Value {
        let peers = self.store.list();
        let mut set = JoinSet::new();

        for peer in peers {
            let this = self.clone_for_task();
            set.spawn(async move {
                let probe = this.signed_request(&peer, "GET", "/api/ping", None).await;
                let entry = match probe {
                    Ok(answer) if answer.ok() => serde_json::json!({
                        "peer_id": peer.peer_id,
                        "label": peer.label,
                        "address": peer.last_address,
                        "reachable": true,
                        "ping": answer.json(),
                    }),
                    Ok(answer) => serde_json::json!({
                        "peer_id": peer.peer_id,
                        "label": peer.label,
                        "address": peer.last_address,
                        "reachable": false,
                        "error": format!("status {}", answer.status),
                    }),
                    Err(e) => serde_json::json!({
                        "peer_id": peer.peer_id,
                        "label": peer.label,
                        "address": peer.last_address,
                        "reachable": false,
                        "error": e.to_string(),
                    }),
                };
                entry
            });
        }

        let mut entries = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(entry) = joined {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| {
            a["peer_id"]
                .as_str()
                .unwrap_or("")
                .cmp(b["peer_id"].as_str().unwrap_or(""))
        });

        serde_json::json!({
            "status": "ok",
            "count": entries.len(),
            "peers": entries,
        })
    }

    /// Fan the same request out to all trusted peers. The result always
    /// carries one entry per peer; failures become error entries.
    pub async fn broadcast(
        &self,
        method: &str,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> serde_json::Value {
        let peers: Vec<_> = self.store.list().into_iter().filter(|p| p.trusted).collect();
        let mut set = JoinSet::new();

        for peer in peers {
            let this = self.clone_for_task();
            let method = method.to_string();
            let endpoint = endpoint.to_string();
            let body = body.cloned();
            set.spawn(async move {
                let result = this
                    .signed_request(&peer, &method, &endpoint, body.as_ref())
                    .await;
                let value = match result {
                    Ok(answer) if answer.ok() => answer.json(),
                    Ok(answer) => serde_json::json!({
                        "error": format!("status {}", answer.status),
                        "body": answer.json(),
                    }),
                    Err(e) => serde_json::json!({ "error": e.to_string() }),
                };
                (peer.peer_id, value)
            });
        }

        let mut results = serde_json::Map::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((peer_id, value)) = joined {
                results.insert(peer_id, value);
            }
        }

        serde_json::json!({
            "status": "ok",
            "count": results.len(),
            "results": results,
        })
    }

    /// The client-driven plan for installing the agent on another peer
    pub fn deploy_steps(&self, target_id: &str) -> Result<serde_json::Value> {
        let peer = self
            .store
            .get(target_id)
            .ok_or_else(|| AgentError::NotFound(format!("unknown peer {}", target_id)))?;

        Ok(serde_json::json!({
            "status": "ok",
            "target": peer.peer_id,
            "steps": [
                { "step": 1, "action": "download", "detail": "fetch the agent package from this device (apps/apk)" },
                { "step": 2, "action": "send", "detail": "push the package to the target over the transfer channel" },
                { "step": 3, "action": "install", "detail": "invoke apps/install on the target" },
            ],
        }))
    }

    /// Look up a peer record
    pub fn peer(&self, peer_id: &str) -> Option<PairedDevice> {
        self.store.get(peer_id)
    }

    fn clone_for_task(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            timeout: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use tempfile::TempDir;

    fn store_with_peer(address: &str) -> (TempDir, Arc<PairingStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PairingStore::open(dir.path().join("state.json")).unwrap());
        let peer = KeyPair::generate();
        let pending = store
            .create_pending("peer-x", "Other", &peer.public_key_b64(), address)
            .unwrap();
        store.approve(&pending.challenge_id).unwrap();
        (dir, store)
    }

    #[test]
    fn test_peer_http_addr_normalization() {
        let (_dir, store) = store_with_peer("192.168.1.9");
        let peer = store.get("peer-x").unwrap();
        assert_eq!(peer_http_addr(&peer).unwrap(), "192.168.1.9:15555");

        let (_dir, store) = store_with_peer("192.168.1.9:9000");
        let peer = store.get("peer-x").unwrap();
        assert_eq!(peer_http_addr(&peer).unwrap(), "192.168.1.9:9000");
    }

    #[test]
    fn test_peer_without_address_is_error() {
        let (_dir, store) = store_with_peer("");
        let peer = store.get("peer-x").unwrap();
        assert!(peer_http_addr(&peer).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_peer() {
        let (_dir, store) = store_with_peer("");
        let orchestrator = Orchestrator::new(store);
        let result = orchestrator.dispatch("nobody", "GET", "/api/ping", None).await;
        assert!(matches!(result, Err(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_broadcast_reports_unreachable_peer() {
        // Peer with a dead address: entry must still appear, as an error
        let (_dir, store) = store_with_peer("127.0.0.1:1");
        let orchestrator = Orchestrator::new(store).with_timeout(Duration::from_millis(500));

        let result = orchestrator.broadcast("GET", "/api/ping", None).await;
        assert_eq!(result["count"], 1);
        assert!(result["results"]["peer-x"]["error"].is_string());
    }

    #[tokio::test]
    async fn test_topology_reports_unreachable_peer() {
        let (_dir, store) = store_with_peer("127.0.0.1:1");
        let orchestrator = Orchestrator::new(store).with_timeout(Duration::from_millis(500));

        let result = orchestrator.topology().await;
        assert_eq!(result["count"], 1);
        assert_eq!(result["peers"][0]["reachable"], false);
    }

    #[test]
    fn test_deploy_steps() {
        let (_dir, store) = store_with_peer("10.0.0.2");
        let orchestrator = Orchestrator::new(store);

        let plan = orchestrator.deploy_steps("peer-x").unwrap();
        assert_eq!(plan["steps"].as_array().unwrap().len(), 3);
        assert!(orchestrator.deploy_steps("ghost").is_err());
    }
}
