//! Integration tests for the agent core
//!
//! These bring up real agents on ephemeral ports and drive them over
//! TCP: pairing, signed requests, replay protection, bulk transfer and
//! mesh broadcast.

use droidlink_core::crypto::{self, KeyPair};
use droidlink_core::host::host_providers;
use droidlink_core::lifecycle::{AgentConfig, LifecycleController};
use droidlink_core::orchestrator::http_request;
use droidlink_core::pairing::now_ms;
use droidlink_core::transfer::{ClientAuth, FrameHeader, TransferClient, HEADER_SIZE};
use std::net::IpAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const TOKEN: &str = "integration-test-token";

struct TestAgent {
    _data_dir: TempDir,
    sandbox: TempDir,
    controller: LifecycleController,
}

impl TestAgent {
    async fn start(label: &str) -> Self {
        let data_dir = TempDir::new().unwrap();
        let sandbox = TempDir::new().unwrap();

        let config = AgentConfig {
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            http_port: 0,
            transfer_port: 0,
            data_dir: data_dir.path().to_path_buf(),
            label: label.to_string(),
            token: Some(TOKEN.to_string()),
            sandbox_root: Some(sandbox.path().to_path_buf()),
            enable_discovery: false,
            ..AgentConfig::default()
        };

        let providers = host_providers(config.sandbox_root.clone());
        let controller = LifecycleController::start(config, providers).await.unwrap();

        Self {
            _data_dir: data_dir,
            sandbox,
            controller,
        }
    }

    fn http_addr(&self) -> String {
        self.controller.http_addr().to_string()
    }

    fn transfer_addr(&self) -> String {
        self.controller.transfer_addr().to_string()
    }
}

async fn api_call(
    addr: &str,
    method: &str,
    target: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> (u16, serde_json::Value) {
    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    if let Some(token) = token {
        headers.push(("X-Agent-Token".to_string(), token.to_string()));
    }
    let body_bytes = body.map(|v| v.to_string().into_bytes());

    let answer = http_request(
        addr,
        method,
        target,
        &headers,
        body_bytes.as_deref(),
        Duration::from_secs(10),
    )
    .await
    .unwrap();

    (answer.status, answer.json())
}

async fn signed_call(
    addr: &str,
    method: &str,
    target: &str,
    peer_id: &str,
    secret: &[u8; 32],
    timestamp: u64,
    tamper: bool,
) -> (u16, serde_json::Value) {
    let message = format!("{}|{}|{}", method, target, timestamp);
    let mut signature = crypto::hmac_sign(secret, &message).unwrap();
    if tamper {
        let flipped = if signature.ends_with('0') { "1" } else { "0" };
        signature.truncate(signature.len() - 1);
        signature.push_str(flipped);
    }

    let headers = vec![
        ("X-Peer-Id".to_string(), peer_id.to_string()),
        ("X-Peer-Timestamp".to_string(), timestamp.to_string()),
        ("X-Peer-Signature".to_string(), signature),
    ];

    let answer = http_request(addr, method, target, &headers, None, Duration::from_secs(10))
        .await
        .unwrap();
    (answer.status, answer.json())
}

// ── Scenario: fresh pairing, then authenticated peer requests ───────

#[tokio::test]
async fn test_pairing_flow_and_signed_requests() {
    let agent = TestAgent::start("Responder").await;
    let addr = agent.http_addr();
    let client_keys = KeyPair::generate();

    // pair-init is open
    let (status, init) = api_call(
        &addr,
        "POST",
        "/api/peer/pair-init",
        None,
        Some(serde_json::json!({
            "device_id": "client-device",
            "label": "Integration Client",
            "public_key": client_keys.public_key_b64(),
        })),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(init["status"], "pending_approval");

    // Both sides compute the same confirmation code
    let responder_pub = crypto::decode_public_key(init["public_key"].as_str().unwrap()).unwrap();
    let expected_code = crypto::confirm_code(&client_keys.public_key_bytes(), &responder_pub);
    assert_eq!(init["confirm_code"], expected_code);

    // Approval with the biometric assertion
    let (status, approved) = api_call(
        &addr,
        "POST",
        "/api/peer/pair-approve",
        None,
        Some(serde_json::json!({
            "challenge_id": init["challenge_id"],
            "biometric_verified": true,
        })),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(approved["status"], "ok");
    // The shared secret never appears in the reply
    assert!(approved["device"].get("shared_secret").is_none());

    // A second approve on the same challenge cannot transition again
    let (status, _) = api_call(
        &addr,
        "POST",
        "/api/peer/pair-approve",
        None,
        Some(serde_json::json!({
            "challenge_id": init["challenge_id"],
            "biometric_verified": true,
        })),
    )
    .await;
    assert_eq!(status, 404);

    // Signed request from the paired client
    let secret = client_keys
        .shared_secret(init["public_key"].as_str().unwrap())
        .unwrap();
    let (status, pong) = signed_call(
        &addr,
        "GET",
        "/api/ping",
        "client-device",
        &secret,
        now_ms(),
        false,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(pong["status"], "ok");

    // Stale replay is rejected
    let (status, body) = signed_call(
        &addr,
        "GET",
        "/api/ping",
        "client-device",
        &secret,
        now_ms() - 10 * 60 * 1000,
        false,
    )
    .await;
    assert_eq!(status, 403);
    assert!(body["error"].as_str().unwrap().contains("expired"));

    // Tampered signature is rejected
    let (status, body) = signed_call(
        &addr,
        "GET",
        "/api/ping",
        "client-device",
        &secret,
        now_ms(),
        true,
    )
    .await;
    assert_eq!(status, 403);
    assert!(body["error"].as_str().unwrap().contains("HMAC"));

    agent.controller.stop().await;
}

// ── Scenario: controller token enforcement ──────────────────────────

#[tokio::test]
async fn test_controller_token_enforcement() {
    let agent = TestAgent::start("TokenCheck").await;
    let addr = agent.http_addr();
    std::fs::write(agent.sandbox.path().join("seed.txt"), b"seed").unwrap();

    // Ping responds regardless of token state
    let (status, _) = api_call(&addr, "GET", "/api/ping", None, None).await;
    assert_eq!(status, 200);

    // Everything else rejects without the token
    let (status, body) = api_call(&addr, "GET", "/api/files/list?path=.", None, None).await;
    assert_eq!(status, 401);
    assert!(body["error"].is_string());

    // And succeeds with it
    let (status, body) =
        api_call(&addr, "GET", "/api/files/list?path=.", Some(TOKEN), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 1);
    assert_eq!(body["files"][0]["name"], "seed.txt");

    // Wrong token is still unauthorized
    let (status, _) = api_call(&addr, "GET", "/api/files/list?path=.", Some("nope"), None).await;
    assert_eq!(status, 401);

    agent.controller.stop().await;
}

// ── Scenario: transfer round-trip with hashes ───────────────────────

#[tokio::test]
async fn test_transfer_push_pull_roundtrip() {
    let agent = TestAgent::start("Mover").await;
    let scratch = TempDir::new().unwrap();

    // 2 MiB of pseudo-random bytes
    let payload: Vec<u8> = (0..2 * 1024 * 1024u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
        .collect();
    let local = scratch.path().join("upload.bin");
    std::fs::write(&local, &payload).unwrap();
    let expected_hash = crypto::sha256_hex(&payload);

    let client = TransferClient::new(&agent.transfer_addr(), ClientAuth::Token(TOKEN.to_string()));

    // Push
    let reply = client.push(&local, "incoming/upload.bin").await.unwrap();
    assert_eq!(reply.status.as_deref(), Some("ok"));
    assert_eq!(reply.bytes_written, Some(payload.len() as u64));
    assert_eq!(reply.sha256.as_deref(), Some(expected_hash.as_str()));
    assert_eq!(
        std::fs::read(agent.sandbox.path().join("incoming/upload.bin")).unwrap(),
        payload
    );

    // Stat
    let stat = client.stat("incoming/upload.bin").await.unwrap();
    assert_eq!(stat.exists, Some(true));
    assert_eq!(stat.size, Some(payload.len() as u64));

    // Pull it back
    let restored = scratch.path().join("download.bin");
    let outcome = client.pull("incoming/upload.bin", &restored).await.unwrap();
    assert_eq!(outcome.bytes, payload.len() as u64);
    assert_eq!(outcome.local_sha256, expected_hash);
    assert_eq!(outcome.remote_sha256, expected_hash);
    assert!(outcome.hash_match());
    assert_eq!(std::fs::read(&restored).unwrap(), payload);

    // Counters saw both directions
    assert!(agent.controller.counters().total_bytes() >= 2 * payload.len() as u64);

    agent.controller.stop().await;
}

#[tokio::test]
async fn test_transfer_detects_hash_mismatch() {
    let agent = TestAgent::start("Checker").await;

    let mut stream = tokio::net::TcpStream::connect(agent.transfer_addr())
        .await
        .unwrap();

    let mut header = FrameHeader::request("push", "incoming/broken.bin");
    header.size = Some(5);
    header.token = Some(TOKEN.to_string());
    stream.write_all(&header.encode().unwrap()).await.unwrap();

    stream.write_all(b"hello").await.unwrap();
    // Wrong (non-zero) trailer
    stream.write_all(&[0xABu8; 32]).await.unwrap();

    let mut reply = [0u8; HEADER_SIZE];
    stream.read_exact(&mut reply).await.unwrap();
    let reply = FrameHeader::decode(&reply).unwrap();
    assert_eq!(reply.status.as_deref(), Some("hash_mismatch"));
    assert_eq!(reply.sha256.as_deref(), Some(crypto::sha256_hex(b"hello").as_str()));

    agent.controller.stop().await;
}

#[tokio::test]
async fn test_transfer_accepts_zero_trailer() {
    let agent = TestAgent::start("Lenient").await;

    let mut stream = tokio::net::TcpStream::connect(agent.transfer_addr())
        .await
        .unwrap();

    let mut header = FrameHeader::request("push", "incoming/nohash.bin");
    header.size = Some(5);
    header.token = Some(TOKEN.to_string());
    stream.write_all(&header.encode().unwrap()).await.unwrap();

    stream.write_all(b"hello").await.unwrap();
    // All-zero trailer: "client did not compute"
    stream.write_all(&[0u8; 32]).await.unwrap();

    let mut reply = [0u8; HEADER_SIZE];
    stream.read_exact(&mut reply).await.unwrap();
    let reply = FrameHeader::decode(&reply).unwrap();
    assert_eq!(reply.status.as_deref(), Some("ok"));

    agent.controller.stop().await;
}

#[tokio::test]
async fn test_transfer_rejects_bad_token_and_traversal() {
    let agent = TestAgent::start("Guard").await;

    // Bad token
    let mut stream = tokio::net::TcpStream::connect(agent.transfer_addr())
        .await
        .unwrap();
    let mut header = FrameHeader::request("stat", "x");
    header.token = Some("wrong".to_string());
    stream.write_all(&header.encode().unwrap()).await.unwrap();

    let mut reply = [0u8; HEADER_SIZE];
    stream.read_exact(&mut reply).await.unwrap();
    let reply = FrameHeader::decode(&reply).unwrap();
    assert_eq!(reply.status.as_deref(), Some("error"));
    assert_eq!(reply.code, Some(401));

    // Traversal out of the sandbox
    let mut stream = tokio::net::TcpStream::connect(agent.transfer_addr())
        .await
        .unwrap();
    let mut header = FrameHeader::request("pull", "../outside.txt");
    header.token = Some(TOKEN.to_string());
    stream.write_all(&header.encode().unwrap()).await.unwrap();

    let mut reply = [0u8; HEADER_SIZE];
    stream.read_exact(&mut reply).await.unwrap();
    let reply = FrameHeader::decode(&reply).unwrap();
    assert_eq!(reply.status.as_deref(), Some("error"));
    assert_eq!(reply.code, Some(403));

    agent.controller.stop().await;
}

// ── Scenario: broadcast totality with a dead peer ───────────────────

#[tokio::test]
async fn test_broadcast_reports_every_peer() {
    let alpha = TestAgent::start("Alpha").await;
    let beta = TestAgent::start("Beta").await;

    let store_a = alpha.controller.store();
    let store_b = beta.controller.store();

    // Pair alpha <-> beta through the store API (the HTTP flow is
    // covered above); both ends derive the same secret via ECDH.
    let pending = store_a
        .create_pending(
            &beta.controller.device_id(),
            "Beta",
            &store_b.public_key_b64(),
            &beta.http_addr(),
        )
        .unwrap();
    store_a.approve(&pending.challenge_id).unwrap();

    let pending = store_b
        .create_pending(
            &alpha.controller.device_id(),
            "Alpha",
            &store_a.public_key_b64(),
            &alpha.http_addr(),
        )
        .unwrap();
    store_b.approve(&pending.challenge_id).unwrap();

    // And one peer whose network is unplugged
    let ghost_keys = KeyPair::generate();
    let pending = store_a
        .create_pending("ghost-peer", "Ghost", &ghost_keys.public_key_b64(), "127.0.0.1:1")
        .unwrap();
    store_a.approve(&pending.challenge_id).unwrap();

    let (status, result) = api_call(
        &alpha.http_addr(),
        "POST",
        "/api/orchestrator/broadcast",
        Some(TOKEN),
        Some(serde_json::json!({
            "method": "GET",
            "endpoint": "/api/ping",
        })),
    )
    .await;

    assert_eq!(status, 200);
    // One entry per paired peer, even for the failure
    assert_eq!(result["count"], 2);
    let results = &result["results"];
    assert_eq!(results[beta.controller.device_id().as_str()]["status"], "ok");
    assert!(results["ghost-peer"]["error"].is_string());

    // Topology agrees
    let (status, topo) = api_call(
        &alpha.http_addr(),
        "GET",
        "/api/orchestrator/topology",
        Some(TOKEN),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(topo["count"], 2);

    alpha.controller.stop().await;
    beta.controller.stop().await;
}

// ── Peer data plane over HTTP ───────────────────────────────────────

#[tokio::test]
async fn test_peer_send_writes_file() {
    let agent = TestAgent::start("Receiver").await;
    let addr = agent.http_addr();
    let client_keys = KeyPair::generate();

    let (_, init) = api_call(
        &addr,
        "POST",
        "/api/peer/pair-init",
        None,
        Some(serde_json::json!({
            "device_id": "sender-device",
            "label": "Sender",
            "public_key": client_keys.public_key_b64(),
        })),
    )
    .await;
    api_call(
        &addr,
        "POST",
        "/api/peer/pair-approve",
        None,
        Some(serde_json::json!({
            "challenge_id": init["challenge_id"],
            "biometric_verified": true,
        })),
    )
    .await;

    let secret = client_keys
        .shared_secret(init["public_key"].as_str().unwrap())
        .unwrap();

    let target = "/api/peer/send?path=drop/note.txt";
    let timestamp = now_ms().to_string();
    let signature =
        crypto::hmac_sign(&secret, &format!("POST|{}|{}", target, timestamp)).unwrap();
    let headers = vec![
        ("X-Peer-Id".to_string(), "sender-device".to_string()),
        ("X-Peer-Timestamp".to_string(), timestamp),
        ("X-Peer-Signature".to_string(), signature),
    ];

    let answer = http_request(
        &addr,
        "POST",
        target,
        &headers,
        Some(b"hello from a peer"),
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    assert_eq!(answer.status, 200);

    assert_eq!(
        std::fs::read(agent.sandbox.path().join("drop/note.txt")).unwrap(),
        b"hello from a peer"
    );

    agent.controller.stop().await;
}

// ── Shell over HTTP ─────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn test_shell_exec_over_http() {
    let agent = TestAgent::start("Sheller").await;

    let (status, body) = api_call(
        &agent.http_addr(),
        "POST",
        "/api/shell/exec",
        Some(TOKEN),
        Some(serde_json::json!({ "command": "echo agent-test" })),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["exit_code"], 0);
    assert_eq!(body["stdout"].as_str().unwrap().trim(), "agent-test");

    agent.controller.stop().await;
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_closes_listeners() {
    let agent = TestAgent::start("Stopper").await;
    let addr = agent.http_addr();

    let (status, _) = api_call(&addr, "GET", "/api/ping", None, None).await;
    assert_eq!(status, 200);

    agent.controller.stop().await;

    // New connections are refused once stopped
    tokio::time::sleep(Duration::from_millis(100)).await;
    let result = http_request(&addr, "GET", "/api/ping", &[], None, Duration::from_secs(2)).await;
    assert!(result.is_err());
}
