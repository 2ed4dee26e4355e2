//! Command execution with deadlines, plus property and settings access

use super::{json_body, require_param, ApiError, HandlerResult};
use crate::http::{Request, Response};
use crate::providers::ShellProvider;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::debug;

/// Default command deadline
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ShellHandler {
    shell: Arc<dyn ShellProvider>,
    default_timeout: Duration,
}

#[derive(Deserialize)]
struct ExecBody {
    command: String,
    /// Seconds; defaults to the handler deadline
    timeout: Option<u64>,
}

#[derive(Deserialize)]
struct SettingsBody {
    namespace: String,
    key: String,
    value: String,
}

impl ShellHandler {
    pub fn new(shell: Arc<dyn ShellProvider>) -> Self {
        Self {
            shell,
            default_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub async fn handle(&self, action: &str, request: &Request) -> HandlerResult {
        match action {
            "exec" => self.exec(request).await,
            "exec-stream" => self.exec_stream(request).await,
            "getprop" => {
                let prop = require_param(request, "prop")?;
                let value = self.shell.getprop(prop)?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "prop": prop,
                    "value": value,
                })))
            }
            "settings" => self.settings(request),
            _ => Err(ApiError::NotFound(format!("unknown shell action '{}'", action))),
        }
    }

    fn deadline(&self, body: &ExecBody) -> Duration {
        body.timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    async fn exec(&self, request: &Request) -> HandlerResult {
        if request.method != "POST" {
            return Err(ApiError::BadRequest("exec requires POST".to_string()));
        }
        let body: ExecBody = json_body(request)?;
        if body.command.trim().is_empty() {
            return Err(ApiError::BadRequest("empty command".to_string()));
        }

        let mut cmd = self.shell.command(&body.command)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = std::time::Instant::now();
        let deadline = self.deadline(&body);

        // Dropping the timed-out future kills the child (kill_on_drop)
        let output = tokio::time::timeout(deadline, cmd.output())
            .await
            .map_err(|_| {
                ApiError::Internal(format!(
                    "command timed out after {}s",
                    deadline.as_secs()
                ))
            })?
            .map_err(|e| ApiError::Internal(format!("spawn failed: {}", e)))?;

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "exit_code": output.status.code().unwrap_or(-1),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "duration_ms": started.elapsed().as_millis() as u64,
        })))
    }

    /// Chunked variant: stdout is forwarded as it is produced. The
    /// pump stops when the client goes away or the deadline passes.
    async fn exec_stream(&self, request: &Request) -> HandlerResult {
        if request.method != "POST" {
            return Err(ApiError::BadRequest("exec-stream requires POST".to_string()));
        }
        let body: ExecBody = json_body(request)?;
        if body.command.trim().is_empty() {
            return Err(ApiError::BadRequest("empty command".to_string()));
        }

        let mut cmd = self.shell.command(&body.command)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ApiError::Internal(format!("spawn failed: {}", e)))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ApiError::Internal("no stdout pipe".to_string()))?;

        let deadline = self.deadline(&body);
        let (tx, rx) = mpsc::channel::<Vec<u8>>(16);

        tokio::spawn(async move {
            let pump = async {
                let mut buf = vec![0u8; 8 * 1024];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).await.is_err() {
                                // Client hung up; stop the command
                                break;
                            }
                        }
                    }
                }
            };

            if tokio::time::timeout(deadline, pump).await.is_err() {
                debug!("exec-stream deadline hit, killing child");
            }
            let _ = child.kill().await;
            let _ = child.wait().await;
        });

        Ok(Response::chunked("application/octet-stream", rx))
    }

    fn settings(&self, request: &Request) -> HandlerResult {
        match request.method.as_str() {
            "GET" => {
                let namespace = require_param(request, "namespace")?;
                let key = require_param(request, "key")?;
                let value = self.shell.settings_get(namespace, key)?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "namespace": namespace,
                    "key": key,
                    "value": value,
                })))
            }
            "POST" => {
                let body: SettingsBody = json_body(request)?;
                self.shell
                    .settings_put(&body.namespace, &body.key, &body.value)?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "namespace": body.namespace,
                    "key": body.key,
                })))
            }
            _ => Err(ApiError::BadRequest("settings requires GET or POST".to_string())),
        }
    }
}
