//! Host-platform provider implementations
//!
//! These back the provider seams on a desktop or CI host: real
//! filesystem, real shell, sysinfo-based introspection. Package,
//! contact and SMS stores have no host counterpart and are wired to
//! [`Unsupported`].

use crate::pairing::PendingPairing;
use crate::providers::{
    BatteryStatus, DeviceInfo, DeviceProvider, FilesProvider, NetworkInterface,
    ProviderError, ProviderResult, Providers, SecurityDelegate, ShellProvider, StorageVolume,
    Unsupported,
};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Device introspection backed by sysinfo
pub struct HostDevice;

impl DeviceProvider for HostDevice {
    fn info(&self) -> ProviderResult<DeviceInfo> {
        Ok(DeviceInfo {
            model: sysinfo::System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
            manufacturer: std::env::consts::OS.to_string(),
            os: std::env::consts::OS.to_string(),
            os_version: sysinfo::System::os_version().unwrap_or_else(|| "unknown".to_string()),
            firmware: sysinfo::System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn battery(&self) -> ProviderResult<BatteryStatus> {
        read_sysfs_battery().ok_or(ProviderError::Unsupported)
    }

    fn network(&self) -> ProviderResult<Vec<NetworkInterface>> {
        let interfaces = local_ip_address::list_afinet_netifas()
            .map_err(|e| ProviderError::Failed(format!("interface enumeration failed: {}", e)))?;

        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, ip) in interfaces {
            if ip.is_ipv4() && !ip.is_loopback() {
                by_name.entry(name).or_default().push(ip.to_string());
            }
        }

        Ok(by_name
            .into_iter()
            .map(|(name, addresses)| NetworkInterface { name, addresses })
            .collect())
    }

    fn storage(&self) -> ProviderResult<Vec<StorageVolume>> {
        Ok(disk_volumes())
    }

    fn properties(&self) -> ProviderResult<BTreeMap<String, String>> {
        let mut props = BTreeMap::new();
        props.insert("os.name".to_string(), std::env::consts::OS.to_string());
        props.insert("os.arch".to_string(), std::env::consts::ARCH.to_string());
        if let Some(version) = sysinfo::System::os_version() {
            props.insert("os.version".to_string(), version);
        }
        if let Some(kernel) = sysinfo::System::kernel_version() {
            props.insert("os.kernel".to_string(), kernel);
        }
        if let Some(host) = sysinfo::System::host_name() {
            props.insert("net.hostname".to_string(), host);
        }
        Ok(props)
    }

    fn permissions(&self) -> ProviderResult<Vec<String>> {
        Err(ProviderError::Unsupported)
    }

    fn screenshot_png(&self) -> ProviderResult<Vec<u8>> {
        Err(ProviderError::Unsupported)
    }
}

/// Battery state from Linux sysfs, if present
fn read_sysfs_battery() -> Option<BatteryStatus> {
    #[cfg(target_os = "linux")]
    {
        for bat in ["BAT0", "BAT1"] {
            let base = format!("/sys/class/power_supply/{}", bat);
            let capacity = std::fs::read_to_string(format!("{}/capacity", base)).ok()?;
            let status = std::fs::read_to_string(format!("{}/status", base)).unwrap_or_default();
            if let Ok(level) = capacity.trim().parse::<u8>() {
                return Some(BatteryStatus {
                    level: level.min(100),
                    charging: status.trim() == "Charging",
                });
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Mounted volumes via sysinfo
pub fn disk_volumes() -> Vec<StorageVolume> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .map(|disk| StorageVolume {
            label: disk.name().to_string_lossy().into_owned(),
            path: disk.mount_point().to_string_lossy().into_owned(),
            total_bytes: disk.total_space(),
            free_bytes: disk.available_space(),
        })
        .collect()
}

/// Filesystem access confined to an optional sandbox root
pub struct HostFiles {
    root: Option<PathBuf>,
}

impl HostFiles {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }
}

impl FilesProvider for HostFiles {
    fn resolve(&self, raw: &str) -> ProviderResult<PathBuf> {
        if raw.is_empty() {
            return Err(ProviderError::Invalid("empty path".to_string()));
        }

        let requested = Path::new(raw);
        if requested
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ProviderError::Denied("path traversal rejected".to_string()));
        }

        let absolute = match (&self.root, requested.is_absolute()) {
            (Some(root), false) => root.join(requested),
            (Some(root), true) => {
                let path = requested.to_path_buf();
                if !path.starts_with(root) {
                    return Err(ProviderError::Denied(
                        "path escapes sandbox root".to_string(),
                    ));
                }
                path
            }
            (None, true) => requested.to_path_buf(),
            (None, false) => {
                return Err(ProviderError::Invalid("path must be absolute".to_string()))
            }
        };

        Ok(absolute)
    }

    fn storage(&self) -> ProviderResult<Vec<StorageVolume>> {
        Ok(disk_volumes())
    }
}

/// Command execution through the host shell
pub struct HostShell;

impl ShellProvider for HostShell {
    fn command(&self, command_line: &str) -> ProviderResult<tokio::process::Command> {
        #[cfg(unix)]
        {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(command_line);
            Ok(cmd)
        }
        #[cfg(windows)]
        {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C").arg(command_line);
            Ok(cmd)
        }
    }

    fn getprop(&self, _key: &str) -> ProviderResult<String> {
        Err(ProviderError::Unsupported)
    }

    fn settings_get(&self, _namespace: &str, _key: &str) -> ProviderResult<String> {
        Err(ProviderError::Unsupported)
    }

    fn settings_put(&self, _namespace: &str, _key: &str, _value: &str) -> ProviderResult<()> {
        Err(ProviderError::Unsupported)
    }
}

/// Security hooks for a headless host: the device is assumed locked and
/// pairing requests are surfaced on the log for the operator to compare
/// codes.
pub struct HostSecurity;

impl SecurityDelegate for HostSecurity {
    fn device_secure(&self) -> bool {
        true
    }

    fn pairing_requested(&self, pending: &PendingPairing) {
        info!(
            "Pairing request from {} ({}), confirmation code {}",
            pending.label, pending.peer_id, pending.confirm_code
        );
    }
}

/// The provider bundle for a host deployment
pub fn host_providers(sandbox_root: Option<PathBuf>) -> Providers {
    Providers {
        device: Arc::new(HostDevice),
        files: Arc::new(HostFiles::new(sandbox_root)),
        apps: Arc::new(Unsupported),
        contacts: Arc::new(Unsupported),
        sms: Arc::new(Unsupported),
        shell: Arc::new(HostShell),
        security: Arc::new(HostSecurity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_inside_sandbox() {
        let files = HostFiles::new(Some(PathBuf::from("/data/agent")));
        assert_eq!(
            files.resolve("photos/a.jpg").unwrap(),
            PathBuf::from("/data/agent/photos/a.jpg")
        );
        assert_eq!(
            files.resolve("/data/agent/x").unwrap(),
            PathBuf::from("/data/agent/x")
        );
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let files = HostFiles::new(Some(PathBuf::from("/data/agent")));
        assert!(matches!(
            files.resolve("../etc/passwd"),
            Err(ProviderError::Denied(_))
        ));
        assert!(matches!(
            files.resolve("photos/../../etc/passwd"),
            Err(ProviderError::Denied(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_escape_of_root() {
        let files = HostFiles::new(Some(PathBuf::from("/data/agent")));
        assert!(matches!(
            files.resolve("/etc/passwd"),
            Err(ProviderError::Denied(_))
        ));
    }

    #[test]
    fn test_resolve_without_root_requires_absolute() {
        let files = HostFiles::new(None);
        assert!(files.resolve("/tmp/x").is_ok());
        assert!(matches!(
            files.resolve("relative/path"),
            Err(ProviderError::Invalid(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_empty() {
        let files = HostFiles::new(None);
        assert!(matches!(files.resolve(""), Err(ProviderError::Invalid(_))));
    }

    #[test]
    fn test_host_device_info() {
        let info = HostDevice.info().unwrap();
        assert!(!info.os.is_empty());
    }

    #[test]
    fn test_host_security_is_secure() {
        assert!(HostSecurity.device_secure());
    }
}
