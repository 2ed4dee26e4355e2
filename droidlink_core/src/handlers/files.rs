//! Filesystem operations on device-accessible storage
//!
//! Every path from the client goes through the files provider, which
//! enforces the sandbox root and rejects traversal.

use super::{require_param, ApiError, HandlerResult};
use crate::http::{Request, Response};
use crate::providers::FilesProvider;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default cap on search results
const SEARCH_LIMIT: usize = 100;

#[derive(Debug, Serialize)]
struct FileEntry {
    name: String,
    path: String,
    is_dir: bool,
    size: u64,
    modified: u64,
    readable: bool,
    writable: bool,
}

fn modified_ms(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn entry_for(path: &Path) -> Option<FileEntry> {
    let metadata = std::fs::symlink_metadata(path).ok()?;
    Some(FileEntry {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned()),
        path: path.to_string_lossy().into_owned(),
        is_dir: metadata.is_dir(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified: modified_ms(&metadata),
        readable: true,
        writable: !metadata.permissions().readonly(),
    })
}

pub struct FilesHandler {
    files: Arc<dyn FilesProvider>,
}

impl FilesHandler {
    pub fn new(files: Arc<dyn FilesProvider>) -> Self {
        Self { files }
    }

    pub fn handle(&self, action: &str, request: &Request) -> HandlerResult {
        match action {
            "list" => self.list(request),
            "read" => self.read(request),
            "write" => self.write(request),
            "stat" => self.stat(request),
            "exists" => self.exists(request),
            "hash" => self.hash(request),
            "mkdir" => self.mkdir(request),
            "delete" => self.delete(request),
            "search" => self.search(request),
            "storage" => self.storage(),
            _ => Err(ApiError::NotFound(format!("unknown files action '{}'", action))),
        }
    }

    fn resolve(&self, request: &Request) -> Result<PathBuf, ApiError> {
        let raw = require_param(request, "path")?;
        Ok(self.files.resolve(raw)?)
    }

    fn list(&self, request: &Request) -> HandlerResult {
        let path = self.resolve(request)?;
        let recursive = request.query_param("recursive") == Some("true");

        if !path.is_dir() {
            return Err(ApiError::NotFound("not a directory".to_string()));
        }

        let mut entries = Vec::new();
        let mut stack = vec![path.clone()];
        while let Some(dir) = stack.pop() {
            let read_dir = std::fs::read_dir(&dir)?;
            for item in read_dir.flatten() {
                let item_path = item.path();
                if let Some(entry) = entry_for(&item_path) {
                    let descend = recursive && entry.is_dir;
                    entries.push(entry);
                    if descend {
                        stack.push(item_path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "path": path.to_string_lossy(),
            "count": entries.len(),
            "files": entries,
        })))
    }

    fn read(&self, request: &Request) -> HandlerResult {
        let path = self.resolve(request)?;
        if !path.is_file() {
            return Err(ApiError::NotFound("no such file".to_string()));
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());

        Ok(Response::file(path, "application/octet-stream").with_header(
            "Content-Disposition",
            &format!("attachment; filename=\"{}\"", filename),
        ))
    }

    fn write(&self, request: &Request) -> HandlerResult {
        let path = self.resolve(request)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let written = match &request.body_file {
            Some(spooled) => std::fs::copy(spooled, &path)?,
            None => {
                std::fs::write(&path, &request.body)?;
                request.body.len() as u64
            }
        };

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "path": path.to_string_lossy(),
            "written": written,
        })))
    }

    fn stat(&self, request: &Request) -> HandlerResult {
        let path = self.resolve(request)?;
        let entry = entry_for(&path)
            .ok_or_else(|| ApiError::NotFound("no such file or directory".to_string()))?;

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "file": entry,
        })))
    }

    fn exists(&self, request: &Request) -> HandlerResult {
        let path = self.resolve(request)?;
        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "path": path.to_string_lossy(),
            "exists": path.exists(),
        })))
    }

    fn hash(&self, request: &Request) -> HandlerResult {
        let path = self.resolve(request)?;
        if let Some(algo) = request.query_param("algo") {
            if algo != "sha256" {
                return Err(ApiError::BadRequest(format!("unsupported algorithm '{}'", algo)));
            }
        }
        if !path.is_file() {
            return Err(ApiError::NotFound("no such file".to_string()));
        }

        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size: u64 = 0;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "path": path.to_string_lossy(),
            "size": size,
            "sha256": hex::encode(hasher.finalize()),
        })))
    }

    fn mkdir(&self, request: &Request) -> HandlerResult {
        let path = self.resolve(request)?;
        std::fs::create_dir_all(&path)?;
        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "path": path.to_string_lossy(),
        })))
    }

    fn delete(&self, request: &Request) -> HandlerResult {
        let path = self.resolve(request)?;
        let metadata = std::fs::symlink_metadata(&path)
            .map_err(|_| ApiError::NotFound("no such file or directory".to_string()))?;

        if metadata.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "deleted": path.to_string_lossy(),
        })))
    }

    fn search(&self, request: &Request) -> HandlerResult {
        let path = self.resolve(request)?;
        let pattern = require_param(request, "pattern")?;
        let limit: usize = request
            .query_param("limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(SEARCH_LIMIT);

        let matcher: Box<dyn Fn(&str) -> bool> =
            if request.query_param("regex") == Some("true") {
                let re = regex::Regex::new(pattern)
                    .map_err(|e| ApiError::BadRequest(format!("invalid regex: {}", e)))?;
                Box::new(move |name| re.is_match(name))
            } else {
                let needle = pattern.to_lowercase();
                Box::new(move |name| name.to_lowercase().contains(&needle))
            };

        let mut matches = Vec::new();
        let mut stack = vec![path];
        let mut truncated = false;

        // Depth-first walk, capped at `limit` results
        'walk: while let Some(dir) = stack.pop() {
            let read_dir = match std::fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            for item in read_dir.flatten() {
                let item_path = item.path();
                let name = item.file_name().to_string_lossy().into_owned();
                if matcher(&name) {
                    if matches.len() >= limit {
                        truncated = true;
                        break 'walk;
                    }
                    if let Some(entry) = entry_for(&item_path) {
                        matches.push(entry);
                    }
                }
                if item_path.is_dir() {
                    stack.push(item_path);
                }
            }
        }

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "count": matches.len(),
            "truncated": truncated,
            "matches": matches,
        })))
    }

    fn storage(&self) -> HandlerResult {
        let volumes = self.files.storage()?;
        let with_used: Vec<_> = volumes
            .iter()
            .map(|v| {
                serde_json::json!({
                    "label": v.label,
                    "path": v.path,
                    "total_bytes": v.total_bytes,
                    "free_bytes": v.free_bytes,
                    "used_bytes": v.used_bytes(),
                })
            })
            .collect();

        Ok(Response::ok_json(serde_json::json!({
            "status": "ok",
            "volumes": with_used,
        })))
    }
}
