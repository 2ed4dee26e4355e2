//! Minimal HTTP/1.1 request/reply service
//!
//! The agent speaks a deliberately small HTTP subset: request line,
//! headers until the empty line, `Content-Length` body, one request per
//! connection, `Connection: close` on every response. Parsing is done
//! by hand over the buffered stream; no web framework is involved.

use crate::lifecycle::Counters;
use crate::router::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Default port for the JSON API
pub const DEFAULT_HTTP_PORT: u16 = 15555;

/// Longest accepted request or header line
const MAX_LINE: usize = 8 * 1024;

/// Maximum number of request headers
const MAX_HEADERS: usize = 100;

/// Bodies above this size are spooled to a temporary file instead of
/// being held in memory
pub const SPOOL_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Copy-loop chunk for streamed bodies
const STREAM_CHUNK: usize = 64 * 1024;

/// A parsed inbound request
pub struct Request {
    pub method: String,
    /// Exact path-and-query as received; peer signatures cover this
    pub target: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names folded to lowercase
    pub headers: HashMap<String, String>,
    /// In-memory body (empty when spooled)
    pub body: Vec<u8>,
    /// Large upload spooled to disk
    pub body_file: Option<PathBuf>,
    pub peer_addr: SocketAddr,
    _spool: Option<tempfile::TempPath>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|s| s.as_str())
    }

    /// Parse the in-memory body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_loopback(&self) -> bool {
        self.peer_addr.ip().is_loopback()
    }

    /// Build a request by hand (handler tests)
    #[cfg(test)]
    pub fn test(method: &str, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method: method.to_string(),
            target: target.to_string(),
            path,
            query,
            headers: HashMap::new(),
            body: Vec::new(),
            body_file: None,
            peer_addr: "127.0.0.1:9".parse().unwrap(),
            _spool: None,
        }
    }
}

/// Response body variants
#[derive(Debug)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    /// Streamed from disk with a 64 KiB copy loop
    File(PathBuf),
    /// Chunked transfer encoding fed by a channel
    Chunked(mpsc::Receiver<Vec<u8>>),
}

/// An outbound response
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            headers: Vec::new(),
            body: Body::Bytes(value.to_string().into_bytes()),
        }
    }

    pub fn ok_json(value: serde_json::Value) -> Self {
        Self::json(200, &value)
    }

    /// The uniform error envelope
    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    pub fn bytes(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            headers: Vec::new(),
            body: Body::Bytes(body),
        }
    }

    pub fn file(path: PathBuf, content_type: &str) -> Self {
        Self {
            status: 200,
            content_type: content_type.to_string(),
            headers: Vec::new(),
            body: Body::File(path),
        }
    }

    pub fn chunked(content_type: &str, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: content_type.to_string(),
            headers: Vec::new(),
            body: Body::Chunked(rx),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Reason phrase for the handful of status codes the agent emits
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Decode %XX escapes and `+` in a query component
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, query_str) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };

    let mut query = HashMap::new();
    for pair in query_str.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        query.insert(percent_decode(key), percent_decode(value));
    }

    (percent_decode(path), query)
}

/// Read and parse one request from the stream.
///
/// Bodies above [`SPOOL_THRESHOLD`] are streamed to a temporary file;
/// the handler receives its path in `body_file`.
pub async fn read_request<R>(reader: &mut R, peer_addr: SocketAddr) -> crate::error::Result<Request>
where
    R: AsyncRead + AsyncBufReadExt + Unpin,
{
    use crate::error::AgentError;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.is_empty() {
        return Err(AgentError::Http("connection closed before request".to_string()));
    }
    if line.len() > MAX_LINE {
        return Err(AgentError::Http("request line too long".to_string()));
    }

    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| AgentError::Http("missing method".to_string()))?
        .to_ascii_uppercase();
    let target = parts
        .next()
        .ok_or_else(|| AgentError::Http("missing request target".to_string()))?
        .to_string();

    let mut headers = HashMap::new();
    loop {
        line.clear();
        reader.read_line(&mut line).await?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if line.len() > MAX_LINE || headers.len() >= MAX_HEADERS {
            return Err(AgentError::Http("header section too large".to_string()));
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: u64 = headers
        .get("content-length")
        .map(|v| {
            v.parse()
                .map_err(|_| AgentError::Http("invalid content-length".to_string()))
        })
        .transpose()?
        .unwrap_or(0);

    let mut body = Vec::new();
    let mut body_file = None;
    let mut spool = None;

    if content_length > SPOOL_THRESHOLD {
        // Stream the upload to disk
        let tmp = tempfile::NamedTempFile::new()?;
        let tmp_path = tmp.into_temp_path();
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut remaining = content_length;
        let mut buf = vec![0u8; STREAM_CHUNK];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(AgentError::Http("unexpected EOF in request body".to_string()));
            }
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        file.flush().await?;
        body_file = Some(tmp_path.to_path_buf());
        spool = Some(tmp_path);
    } else if content_length > 0 {
        body = vec![0u8; content_length as usize];
        reader.read_exact(&mut body).await?;
    } else if headers.get("content-length").is_none()
        && matches!(method.as_str(), "POST" | "PUT")
    {
        // No declared length: the body runs until the peer half-closes
        reader.read_to_end(&mut body).await?;
    }

    let (path, query) = split_target(&target);

    Ok(Request {
        method,
        target,
        path,
        query,
        headers,
        body,
        body_file,
        peer_addr,
        _spool: spool,
    })
}

/// Serialize a response to the stream
pub async fn write_response<W>(writer: &mut W, response: Response) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let server = format!("droidlink-agent/{}", env!("CARGO_PKG_VERSION"));

    // Resolve file bodies before committing to a status line
    let (response, file) = match response.body {
        Body::File(path) => match tokio::fs::File::open(&path).await {
            Ok(file) => (
                Response {
                    body: Body::Empty,
                    ..response
                },
                Some(file),
            ),
            Err(_) => (Response::error(404, "file not found"), None),
        },
        body => (Response { body, ..response }, None),
    };

    let mut head = format!(
        "HTTP/1.1 {} {}\r\nServer: {}\r\nConnection: close\r\nContent-Type: {}\r\n",
        response.status,
        status_text(response.status),
        server,
        response.content_type,
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }

    match (response.body, file) {
        (_, Some(mut file)) => {
            let len = file.metadata().await?.len();
            head.push_str(&format!("Content-Length: {}\r\n\r\n", len));
            writer.write_all(head.as_bytes()).await?;

            let mut buf = vec![0u8; STREAM_CHUNK];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n]).await?;
            }
        }
        (Body::Empty, None) => {
            head.push_str("Content-Length: 0\r\n\r\n");
            writer.write_all(head.as_bytes()).await?;
        }
        (Body::Bytes(bytes), None) => {
            head.push_str(&format!("Content-Length: {}\r\n\r\n", bytes.len()));
            writer.write_all(head.as_bytes()).await?;
            writer.write_all(&bytes).await?;
        }
        (Body::Chunked(mut rx), None) => {
            head.push_str("Transfer-Encoding: chunked\r\n\r\n");
            writer.write_all(head.as_bytes()).await?;

            while let Some(chunk) = rx.recv().await {
                if chunk.is_empty() {
                    continue;
                }
                writer
                    .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                    .await?;
                writer.write_all(&chunk).await?;
                writer.write_all(b"\r\n").await?;
            }
            writer.write_all(b"0\r\n\r\n").await?;
        }
        (Body::File(_), None) => unreachable!("file bodies are resolved above"),
    }

    writer.flush().await
}

/// The JSON API listener: accepts connections and hands each one to a
/// spawned task that parses, dispatches through the router and replies.
pub struct HttpService {
    router: Arc<Router>,
    counters: Arc<Counters>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl HttpService {
    pub fn new(router: Arc<Router>, counters: Arc<Counters>) -> Self {
        Self {
            router,
            counters,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Accept until the shutdown signal flips
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        info!("HTTP service listening on {}", addr);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("HTTP service stopping");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    debug!("Client connected from {}", peer_addr);
                    let router = Arc::clone(&self.router);
                    let counters = Arc::clone(&self.counters);
                    let read_timeout = self.read_timeout;
                    let write_timeout = self.write_timeout;

                    tokio::spawn(async move {
                        counters.client_connected();
                        if let Err(e) = handle_connection(
                            stream, peer_addr, router, read_timeout, write_timeout,
                        )
                        .await
                        {
                            debug!("Connection from {} ended: {}", peer_addr, e);
                        }
                        counters.client_disconnected();
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    router: Arc<Router>,
    read_timeout: Duration,
    write_timeout: Duration,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match tokio::time::timeout(read_timeout, read_request(&mut reader, peer_addr)).await
    {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            let response = Response::error(400, &format!("malformed request: {}", e));
            let _ = tokio::time::timeout(write_timeout, write_response(&mut write_half, response))
                .await;
            return Ok(());
        }
        Err(_) => {
            let response = Response::error(400, "request read timed out");
            let _ = tokio::time::timeout(write_timeout, write_response(&mut write_half, response))
                .await;
            return Ok(());
        }
    };

    debug!("{} {} from {}", request.method, request.target, peer_addr);
    let response = router.dispatch(request).await;

    match tokio::time::timeout(write_timeout, write_response(&mut write_half, response)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "response write timed out",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.168.1.5:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_parse_get_request() {
        let raw = b"GET /api/files/list?path=%2Fsdcard&recursive=true HTTP/1.1\r\n\
                    Host: device\r\n\
                    X-Agent-Token: secret\r\n\
                    \r\n";
        let mut reader = BufReader::new(&raw[..]);
        let request = read_request(&mut reader, addr()).await.unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api/files/list");
        assert_eq!(request.target, "/api/files/list?path=%2Fsdcard&recursive=true");
        assert_eq!(request.query_param("path"), Some("/sdcard"));
        assert_eq!(request.query_param("recursive"), Some("true"));
        assert_eq!(request.header("x-agent-token"), Some("secret"));
        assert_eq!(request.header("X-Agent-Token"), Some("secret"));
    }

    #[tokio::test]
    async fn test_parse_post_with_body() {
        let body = br#"{"command":"ls"}"#;
        let raw = format!(
            "POST /api/shell/exec HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut bytes = raw.into_bytes();
        bytes.extend_from_slice(body);

        let mut reader = BufReader::new(&bytes[..]);
        let request = read_request(&mut reader, addr()).await.unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(request.body, body);
        let parsed: serde_json::Value = request.json().unwrap();
        assert_eq!(parsed["command"], "ls");
    }

    #[tokio::test]
    async fn test_header_names_case_folded() {
        let raw = b"GET /api/ping HTTP/1.1\r\nX-PEER-ID: abc\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let request = read_request(&mut reader, addr()).await.unwrap();
        assert_eq!(request.header("x-peer-id"), Some("abc"));
    }

    #[tokio::test]
    async fn test_rejects_empty_stream() {
        let raw = b"";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request(&mut reader, addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_truncated_body() {
        let raw = b"POST /api/x HTTP/1.1\r\nContent-Length: 100\r\n\r\nshort";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request(&mut reader, addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_write_json_response() {
        let mut out = Vec::new();
        let response = Response::ok_json(serde_json::json!({"status": "ok"}));
        write_response(&mut out, response).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Server: droidlink-agent/"));
        assert!(text.ends_with("{\"status\":\"ok\"}"));
    }

    #[tokio::test]
    async fn test_write_error_envelope() {
        let mut out = Vec::new();
        write_response(&mut out, Response::error(401, "missing token"))
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(text.ends_with("{\"error\":\"missing token\"}"));
    }

    #[tokio::test]
    async fn test_write_chunked_response() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(b"hello ".to_vec()).await.unwrap();
        tx.send(b"world".to_vec()).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        write_response(&mut out, Response::chunked("text/plain", rx))
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked"));
        assert!(text.contains("6\r\nhello \r\n"));
        assert!(text.contains("5\r\nworld\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("%2Fsdcard%2FDCIM"), "/sdcard/DCIM");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(404), "Not Found");
        assert_eq!(status_text(418), "Unknown");
    }
}
