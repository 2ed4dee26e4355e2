//! Platform provider seams
//!
//! The handlers never touch platform APIs directly: every domain
//! consumes a trait object supplied at startup. The daemon wires host
//! implementations (see [`crate::host`]); tests supply fakes.

use crate::pairing::PendingPairing;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unsupported on this platform")]
    Unsupported,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Denied(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Failed(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub manufacturer: String,
    pub os: String,
    pub os_version: String,
    pub firmware: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Charge percentage 0-100
    pub level: u8,
    pub charging: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    /// IPv4 addresses bound to the interface
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageVolume {
    pub label: String,
    pub path: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl StorageVolume {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInfo {
    pub package: String,
    pub label: String,
    pub version_name: String,
    pub version_code: i64,
    pub target_sdk: i32,
    /// Path to the base APK
    pub source_dir: String,
    /// Paths to split APKs, if any
    #[serde(default)]
    pub split_dirs: Vec<String>,
    pub system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDataPath {
    pub path: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phones: Vec<LabeledValue>,
    #[serde(default)]
    pub emails: Vec<LabeledValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledValue {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsMessage {
    #[serde(default)]
    pub id: i64,
    pub thread_id: i64,
    pub address: String,
    pub body: String,
    /// Epoch milliseconds
    pub date: u64,
    /// "inbox" or "sent"
    pub folder: String,
}

/// Read-only device introspection
pub trait DeviceProvider: Send + Sync {
    fn info(&self) -> ProviderResult<DeviceInfo>;
    fn battery(&self) -> ProviderResult<BatteryStatus>;
    fn network(&self) -> ProviderResult<Vec<NetworkInterface>>;
    fn storage(&self) -> ProviderResult<Vec<StorageVolume>>;
    fn properties(&self) -> ProviderResult<BTreeMap<String, String>>;
    fn permissions(&self) -> ProviderResult<Vec<String>>;
    fn screenshot_png(&self) -> ProviderResult<Vec<u8>>;
}

/// Filesystem access policy: path resolution inside the sandbox root
/// plus the storage report for the files domain
pub trait FilesProvider: Send + Sync {
    /// Resolve a client-supplied path to an absolute path, rejecting
    /// traversal out of the sandbox root where one is configured
    fn resolve(&self, raw: &str) -> ProviderResult<PathBuf>;
    fn storage(&self) -> ProviderResult<Vec<StorageVolume>>;
}

/// Installed-package operations
pub trait AppsProvider: Send + Sync {
    fn list(&self, include_system: bool) -> ProviderResult<Vec<AppInfo>>;
    fn info(&self, package: &str) -> ProviderResult<AppInfo>;
    fn data_paths(&self, package: &str) -> ProviderResult<Vec<AppDataPath>>;
    fn install(&self, apk: &std::path::Path) -> ProviderResult<()>;
    fn uninstall(&self, package: &str) -> ProviderResult<()>;
}

/// Contact book access
pub trait ContactsProvider: Send + Sync {
    fn list(&self) -> ProviderResult<Vec<Contact>>;
    fn insert(&self, contact: Contact) -> ProviderResult<()>;
}

/// SMS store access
pub trait SmsProvider: Send + Sync {
    fn list(&self, limit: usize, offset: usize) -> ProviderResult<Vec<SmsMessage>>;
    fn all(&self) -> ProviderResult<Vec<SmsMessage>>;
    fn count(&self) -> ProviderResult<usize>;
    fn insert(&self, message: SmsMessage) -> ProviderResult<()>;
}

/// Command execution seam. The provider shapes the command; the shell
/// handler owns spawning, deadlines and capture.
pub trait ShellProvider: Send + Sync {
    fn command(&self, command_line: &str) -> ProviderResult<tokio::process::Command>;
    fn getprop(&self, key: &str) -> ProviderResult<String>;
    fn settings_get(&self, namespace: &str, key: &str) -> ProviderResult<String>;
    fn settings_put(&self, namespace: &str, key: &str, value: &str) -> ProviderResult<()>;
}

/// Hooks the surrounding UI layer must implement.
///
/// `biometric_verified` assertions in pairing requests are trusted as
/// given; the platform UI is responsible for performing the real
/// biometric check before asserting the flag. `device_secure` reports
/// whether the device has a screen lock at all.
pub trait SecurityDelegate: Send + Sync {
    fn device_secure(&self) -> bool;
    /// A pairing request arrived and awaits user confirmation of the code
    fn pairing_requested(&self, pending: &PendingPairing);
}

/// The full provider bundle handed to the router
#[derive(Clone)]
pub struct Providers {
    pub device: Arc<dyn DeviceProvider>,
    pub files: Arc<dyn FilesProvider>,
    pub apps: Arc<dyn AppsProvider>,
    pub contacts: Arc<dyn ContactsProvider>,
    pub sms: Arc<dyn SmsProvider>,
    pub shell: Arc<dyn ShellProvider>,
    pub security: Arc<dyn SecurityDelegate>,
}

/// Stand-in for domains the current platform cannot serve
pub struct Unsupported;

impl AppsProvider for Unsupported {
    fn list(&self, _include_system: bool) -> ProviderResult<Vec<AppInfo>> {
        Err(ProviderError::Unsupported)
    }
    fn info(&self, _package: &str) -> ProviderResult<AppInfo> {
        Err(ProviderError::Unsupported)
    }
    fn data_paths(&self, _package: &str) -> ProviderResult<Vec<AppDataPath>> {
        Err(ProviderError::Unsupported)
    }
    fn install(&self, _apk: &std::path::Path) -> ProviderResult<()> {
        Err(ProviderError::Unsupported)
    }
    fn uninstall(&self, _package: &str) -> ProviderResult<()> {
        Err(ProviderError::Unsupported)
    }
}

impl ContactsProvider for Unsupported {
    fn list(&self) -> ProviderResult<Vec<Contact>> {
        Err(ProviderError::Unsupported)
    }
    fn insert(&self, _contact: Contact) -> ProviderResult<()> {
        Err(ProviderError::Unsupported)
    }
}

impl SmsProvider for Unsupported {
    fn list(&self, _limit: usize, _offset: usize) -> ProviderResult<Vec<SmsMessage>> {
        Err(ProviderError::Unsupported)
    }
    fn all(&self) -> ProviderResult<Vec<SmsMessage>> {
        Err(ProviderError::Unsupported)
    }
    fn count(&self) -> ProviderResult<usize> {
        Err(ProviderError::Unsupported)
    }
    fn insert(&self, _message: SmsMessage) -> ProviderResult<()> {
        Err(ProviderError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_volume_used_bytes() {
        let volume = StorageVolume {
            label: "internal".into(),
            path: "/".into(),
            total_bytes: 100,
            free_bytes: 30,
        };
        assert_eq!(volume.used_bytes(), 70);
    }

    #[test]
    fn test_contact_serialization_defaults() {
        let contact: Contact = serde_json::from_str(r#"{"name": "Ada"}"#).unwrap();
        assert_eq!(contact.name, "Ada");
        assert!(contact.phones.is_empty());
        assert!(contact.organization.is_none());
    }

    #[test]
    fn test_unsupported_provider() {
        let provider = Unsupported;
        assert!(matches!(
            AppsProvider::list(&provider, true),
            Err(ProviderError::Unsupported)
        ));
        assert!(matches!(
            ContactsProvider::list(&provider),
            Err(ProviderError::Unsupported)
        ));
        assert!(matches!(
            SmsProvider::count(&provider),
            Err(ProviderError::Unsupported)
        ));
    }
}
