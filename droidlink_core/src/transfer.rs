//! Framed binary transfer channel
//!
//! An independent TCP listener for bulk file movement. Every exchange
//! opens with a 512-byte NUL-padded JSON header; push/pull payloads are
//! followed by a 32-byte SHA-256 trailer so both ends can verify
//! integrity without a second pass over the data.

use crate::auth::AuthGate;
use crate::error::{AgentError, Result};
use crate::lifecycle::Counters;
use crate::pairing::now_ms;
use crate::providers::FilesProvider;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Default port for the transfer channel
pub const DEFAULT_TRANSFER_PORT: u16 = 15556;

/// Fixed frame header size
pub const HEADER_SIZE: usize = 512;

/// Copy-loop and socket buffer size
pub const TRANSFER_BUFFER: usize = 256 * 1024;

/// Concurrent transfer cap; additional connections queue
pub const MAX_CONCURRENT_TRANSFERS: usize = 4;

const HASH_SIZE: usize = 32;

/// The JSON object carried in every 512-byte frame. Request and reply
/// use the same layout with different fields populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    // Controller auth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    // Peer auth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    // Reply fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dir: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
}

impl FrameHeader {
    pub fn request(op: &str, path: &str) -> Self {
        Self {
            op: Some(op.to_string()),
            path: Some(path.to_string()),
            ..Self::default()
        }
    }

    pub fn reply(status: &str) -> Self {
        Self {
            status: Some(status.to_string()),
            ..Self::default()
        }
    }

    pub fn reply_error(code: u16, message: &str) -> Self {
        Self {
            status: Some("error".to_string()),
            code: Some(code),
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some("ok")
    }

    /// Serialize to the fixed 512-byte NUL-padded frame
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let json = serde_json::to_vec(self)?;
        if json.len() > HEADER_SIZE {
            return Err(AgentError::Transfer(format!(
                "frame header too large ({} bytes)",
                json.len()
            )));
        }
        let mut frame = [0u8; HEADER_SIZE];
        frame[..json.len()].copy_from_slice(&json);
        Ok(frame)
    }

    /// Parse a frame, ignoring the NUL padding
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let end = frame
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(frame.len());
        serde_json::from_slice(&frame[..end])
            .map_err(|e| AgentError::Transfer(format!("malformed frame header: {}", e)))
    }
}

/// A socket with both buffers raised to the transfer buffer size
fn tuned_socket(addr: &SocketAddr) -> std::io::Result<tokio::net::TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
        SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
    };
    socket.set_send_buffer_size(TRANSFER_BUFFER as u32)?;
    socket.set_recv_buffer_size(TRANSFER_BUFFER as u32)?;
    Ok(socket)
}

/// Bind the transfer listener with the buffers already raised;
/// accepted connections inherit the listener's buffer sizes.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = tuned_socket(&addr)?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(128)
}

async fn read_frame(stream: &mut TcpStream) -> Result<FrameHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut buf).await?;
    FrameHeader::decode(&buf)
}

async fn write_frame(stream: &mut TcpStream, header: &FrameHeader) -> Result<()> {
    stream.write_all(&header.encode()?).await?;
    stream.flush().await?;
    Ok(())
}

/// The transfer listener
pub struct TransferService {
    gate: Arc<AuthGate>,
    files: Arc<dyn FilesProvider>,
    counters: Arc<Counters>,
    semaphore: Arc<Semaphore>,
}

impl TransferService {
    pub fn new(gate: Arc<AuthGate>, files: Arc<dyn FilesProvider>, counters: Arc<Counters>) -> Self {
        Self {
            gate,
            files,
            counters,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_TRANSFERS)),
        }
    }

    /// Accept until the shutdown signal flips
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let this = Arc::new(self);
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        info!("Transfer service listening on {}", addr);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Transfer service stopping");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Failed to accept transfer connection: {}", e);
                            continue;
                        }
                    };

                    let this = Arc::clone(&this);
                    tokio::spawn(async move {
                        // Backpressure: queue behind the transfer cap
                        let _permit = this.semaphore.acquire().await;
                        if let Err(e) = this.handle_connection(stream, peer_addr).await {
                            debug!("Transfer from {} ended: {}", peer_addr, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;

        let header = match read_frame(&mut stream).await {
            Ok(header) => header,
            Err(e) => {
                // Attempt a terminal error header before closing
                let _ = write_frame(&mut stream, &FrameHeader::reply_error(400, &e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let op = header.op.clone().unwrap_or_default();
        let path = header.path.clone().unwrap_or_default();
        debug!("Transfer {} {} from {}", op, path, peer_addr);

        if let Err(failure) = self.authenticate(&header, peer_addr) {
            let reply = FrameHeader::reply_error(failure.status(), &failure.to_string());
            write_frame(&mut stream, &reply).await?;
            return Ok(());
        }

        self.counters.transfer_started();
        let result = match op.as_str() {
            "push" => self.push(&mut stream, &header).await,
            "pull" => self.pull(&mut stream, &header).await,
            "stat" => self.stat(&mut stream, &header).await,
            other => {
                let reply = FrameHeader::reply_error(400, &format!("unknown op '{}'", other));
                write_frame(&mut stream, &reply).await
            }
        };
        self.counters.transfer_finished();
        result
    }

    /// Token or full peer HMAC over `op|path|timestamp`
    fn authenticate(
        &self,
        header: &FrameHeader,
        peer_addr: SocketAddr,
    ) -> std::result::Result<(), crate::auth::AuthFailure> {
        use crate::auth::AuthFailure;

        match (&header.peer_id, &header.signature, &header.timestamp) {
            (Some(peer_id), Some(signature), Some(timestamp)) => {
                let op = header.op.as_deref().unwrap_or_default();
                let path = header.path.as_deref().unwrap_or_default();
                self.gate
                    .verify_peer_sig(peer_id, timestamp, signature, op, path)?;
                Ok(())
            }
            (None, None, None) => {
                self.gate
                    .verify_token(header.token.as_deref(), peer_addr.ip().is_loopback())?;
                Ok(())
            }
            _ => Err(AuthFailure::Malformed(
                "incomplete peer authentication fields".to_string(),
            )),
        }
    }

    fn resolve(&self, header: &FrameHeader) -> std::result::Result<std::path::PathBuf, String> {
        let raw = header.path.as_deref().unwrap_or_default();
        self.files.resolve(raw).map_err(|e| e.to_string())
    }

    async fn push(&self, stream: &mut TcpStream, header: &FrameHeader) -> Result<()> {
        let size = match header.size {
            Some(size) => size,
            None => {
                let reply = FrameHeader::reply_error(400, "push requires size");
                return write_frame(stream, &reply).await;
            }
        };
        let target = match self.resolve(header) {
            Ok(path) => path,
            Err(e) => {
                let reply = FrameHeader::reply_error(403, &e);
                return write_frame(stream, &reply).await;
            }
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&target).await?;

        // Receive payload, hashing as it lands
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; TRANSFER_BUFFER];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(AgentError::Transfer("EOF mid-payload".to_string()));
            }
            file.write_all(&buf[..n]).await?;
            hasher.update(&buf[..n]);
            remaining -= n as u64;
            self.counters.add_bytes(n as u64);
        }
        file.flush().await?;

        let mut trailer = [0u8; HASH_SIZE];
        stream.read_exact(&mut trailer).await?;

        let computed: [u8; HASH_SIZE] = hasher.finalize().into();
        // An all-zero trailer means the client did not compute a hash
        let status = if trailer == [0u8; HASH_SIZE] || trailer == computed {
            "ok"
        } else {
            "hash_mismatch"
        };

        let mut reply = FrameHeader::reply(status);
        reply.bytes_written = Some(size);
        reply.sha256 = Some(hex::encode(computed));
        write_frame(stream, &reply).await
    }

    async fn pull(&self, stream: &mut TcpStream, header: &FrameHeader) -> Result<()> {
        let path = match self.resolve(header) {
            Ok(path) => path,
            Err(e) => {
                let reply = FrameHeader::reply_error(403, &e);
                return write_frame(stream, &reply).await;
            }
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            _ => {
                let reply = FrameHeader::reply_error(404, "no such file");
                return write_frame(stream, &reply).await;
            }
        };

        let mut reply = FrameHeader::reply("ok");
        reply.size = Some(metadata.len());
        write_frame(stream, &reply).await?;

        let mut file = tokio::fs::File::open(&path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; TRANSFER_BUFFER];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await?;
            hasher.update(&buf[..n]);
            self.counters.add_bytes(n as u64);
        }

        let digest: [u8; HASH_SIZE] = hasher.finalize().into();
        stream.write_all(&digest).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn stat(&self, stream: &mut TcpStream, header: &FrameHeader) -> Result<()> {
        let path = match self.resolve(header) {
            Ok(path) => path,
            Err(e) => {
                let reply = FrameHeader::reply_error(403, &e);
                return write_frame(stream, &reply).await;
            }
        };

        let mut reply = FrameHeader::reply("ok");
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => {
                reply.exists = Some(true);
                reply.is_dir = Some(metadata.is_dir());
                reply.size = Some(if metadata.is_dir() { 0 } else { metadata.len() });
                reply.modified = Some(
                    metadata
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                );
            }
            Err(_) => {
                reply.exists = Some(false);
            }
        }
        write_frame(stream, &reply).await
    }
}

/// Client-side credentials for the transfer channel
#[derive(Clone)]
pub enum ClientAuth {
    /// Loopback with an empty configured token
    None,
    Token(String),
    /// Signed as `local_device_id` with the shared secret of the target
    Peer {
        local_device_id: String,
        secret: [u8; 32],
    },
}

/// Outbound side of the frame protocol
pub struct TransferClient {
    addr: String,
    auth: ClientAuth,
}

/// Result of a pull
pub struct PullOutcome {
    pub header: FrameHeader,
    pub bytes: u64,
    pub local_sha256: String,
    pub remote_sha256: String,
}

impl PullOutcome {
    pub fn hash_match(&self) -> bool {
        self.local_sha256 == self.remote_sha256
    }
}

impl TransferClient {
    pub fn new(addr: &str, auth: ClientAuth) -> Self {
        Self {
            addr: addr.to_string(),
            auth,
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .map_err(|_| AgentError::Network(format!("invalid address {}", self.addr)))?;

        let stream = tuned_socket(&addr)?.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn fill_auth(&self, header: &mut FrameHeader) -> Result<()> {
        match &self.auth {
            ClientAuth::None => {}
            ClientAuth::Token(token) => header.token = Some(token.clone()),
            ClientAuth::Peer {
                local_device_id,
                secret,
            } => {
                let timestamp = now_ms().to_string();
                let message = format!(
                    "{}|{}|{}",
                    header.op.as_deref().unwrap_or_default(),
                    header.path.as_deref().unwrap_or_default(),
                    timestamp
                );
                header.peer_id = Some(local_device_id.clone());
                header.signature = Some(crate::crypto::hmac_sign(secret, &message)?);
                header.timestamp = Some(timestamp);
            }
        }
        Ok(())
    }

    /// Push a local file to `remote_path` on the agent
    pub async fn push(&self, local: &Path, remote_path: &str) -> Result<FrameHeader> {
        let metadata = tokio::fs::metadata(local).await?;
        if !metadata.is_file() {
            return Err(AgentError::Transfer(format!(
                "not a file: {}",
                local.display()
            )));
        }

        let mut header = FrameHeader::request("push", remote_path);
        header.size = Some(metadata.len());
        self.fill_auth(&mut header)?;

        let mut stream = self.connect().await?;
        write_frame(&mut stream, &header).await?;

        let mut file = tokio::fs::File::open(local).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; TRANSFER_BUFFER];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await?;
            hasher.update(&buf[..n]);
        }
        let digest: [u8; HASH_SIZE] = hasher.finalize().into();
        stream.write_all(&digest).await?;
        stream.flush().await?;

        read_frame(&mut stream).await
    }

    /// Pull `remote_path` from the agent into a local file
    pub async fn pull(&self, remote_path: &str, local: &Path) -> Result<PullOutcome> {
        let mut header = FrameHeader::request("pull", remote_path);
        self.fill_auth(&mut header)?;

        let mut stream = self.connect().await?;
        write_frame(&mut stream, &header).await?;

        let reply = read_frame(&mut stream).await?;
        if !reply.is_ok() {
            return Err(AgentError::Transfer(
                reply
                    .error
                    .unwrap_or_else(|| "transfer refused".to_string()),
            ));
        }
        let size = reply
            .size
            .ok_or_else(|| AgentError::Transfer("pull reply missing size".to_string()))?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(local).await?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; TRANSFER_BUFFER];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(AgentError::Transfer("EOF mid-payload".to_string()));
            }
            file.write_all(&buf[..n]).await?;
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        file.flush().await?;

        let mut trailer = [0u8; HASH_SIZE];
        stream.read_exact(&mut trailer).await?;

        Ok(PullOutcome {
            header: reply,
            bytes: size,
            local_sha256: hex::encode(hasher.finalize()),
            remote_sha256: hex::encode(trailer),
        })
    }

    /// Query existence and metadata of a remote path
    pub async fn stat(&self, remote_path: &str) -> Result<FrameHeader> {
        let mut header = FrameHeader::request("stat", remote_path);
        self.fill_auth(&mut header)?;

        let mut stream = self.connect().await?;
        write_frame(&mut stream, &header).await?;
        read_frame(&mut stream).await
    }
}
