//! Configuration management for the agent daemon

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

fn default_http_port() -> u16 {
    droidlink_core::DEFAULT_HTTP_PORT
}

fn default_transfer_port() -> u16 {
    droidlink_core::DEFAULT_TRANSFER_PORT
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

/// Daemon configuration persisted as JSON in the platform config dir
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,

    #[serde(default = "default_bind")]
    pub bind: String,

    /// Human-readable device label; defaults to the hostname
    #[serde(default)]
    pub label: Option<String>,

    /// Where pairing state and the token live; defaults to the
    /// platform data dir
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Confine file operations to this root when set
    #[serde(default)]
    pub sandbox_root: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub discovery: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            transfer_port: default_transfer_port(),
            bind: default_bind(),
            label: None,
            data_dir: None,
            sandbox_root: None,
            discovery: true,
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "droidlink", "droidlink")
            .context("Could not determine config directory")
    }

    /// Get the config file path
    pub fn path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.json"))
    }

    /// Load config from file, or return default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Config =
            serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        Ok(())
    }

    /// The directory pairing state and the token live in
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        Ok(Self::project_dirs()?.data_dir().to_path_buf())
    }
}
