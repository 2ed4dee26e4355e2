//! Paired-device persistence and the pending-pairing table
//!
//! The store is the single owner of pairing state: the device identity,
//! the local key pair, the trusted-peer records and the short-lived
//! pending requests awaiting user approval. Everything else reads
//! through it.

use crate::crypto::{self, KeyPair};
use crate::error::{AgentError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Lifetime of a pending pairing request
pub const PENDING_TTL_MS: u64 = 5 * 60 * 1000;

/// On-disk schema version
const STATE_VERSION: u32 = 1;

/// Current time as epoch milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A device this agent has completed pairing with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    pub peer_id: String,
    pub label: String,
    /// Peer public key, base64 SEC1 point
    pub public_key: String,
    /// Derived shared secret, lowercase hex. Persisted, never served.
    pub shared_secret: String,
    #[serde(default)]
    pub last_address: String,
    pub paired_at: u64,
    pub last_seen: u64,
    #[serde(default = "default_trusted")]
    pub trusted: bool,
}

fn default_trusted() -> bool {
    true
}

impl PairedDevice {
    /// The record as served to clients: everything except the secret
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "peer_id": self.peer_id,
            "label": self.label,
            "public_key": self.public_key,
            "last_address": self.last_address,
            "paired_at": self.paired_at,
            "last_seen": self.last_seen,
            "trusted": self.trusted,
        })
    }

    /// Decode the shared secret for HMAC operations
    pub fn secret_bytes(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.shared_secret)
            .map_err(|e| AgentError::Pairing(format!("corrupt shared secret: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| AgentError::Pairing("shared secret is not 32 bytes".to_string()))
    }
}

/// An inbound pairing request awaiting local user approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPairing {
    pub challenge_id: String,
    pub peer_id: String,
    pub label: String,
    pub public_key: String,
    pub address: String,
    pub confirm_code: String,
    pub created_at: u64,
}

impl PendingPairing {
    pub fn expired_at(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) > PENDING_TTL_MS
    }
}

/// Persisted file layout. Device entries are kept loosely typed so a
/// single corrupt record does not take the whole store down on load.
#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    device_id: String,
    private_key: String,
    devices: Vec<serde_json::Value>,
}

struct Inner {
    devices: HashMap<String, PairedDevice>,
    pending: HashMap<String, PendingPairing>,
}

/// Owner of all pairing state, backed by a single JSON file.
///
/// Mutations serialize under the writer lock and persist atomically
/// (write-temp-then-rename). The pending table is memory-only.
pub struct PairingStore {
    path: PathBuf,
    device_id: String,
    keypair: KeyPair,
    inner: RwLock<Inner>,
}

impl PairingStore {
    /// Load the store from `path`, or initialise a fresh identity and
    /// key pair if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: StateFile = serde_json::from_str(&content)
                .map_err(|e| AgentError::Pairing(format!("corrupt pairing state: {}", e)))?;

            if file.version != STATE_VERSION {
                return Err(AgentError::Pairing(format!(
                    "unsupported pairing state version {}",
                    file.version
                )));
            }

            let keypair = KeyPair::from_b64(&file.private_key)?;

            let mut devices = HashMap::new();
            for entry in file.devices {
                match serde_json::from_value::<PairedDevice>(entry) {
                    Ok(device) => {
                        devices.insert(device.peer_id.clone(), device);
                    }
                    Err(e) => warn!("Skipping malformed paired-device entry: {}", e),
                }
            }

            debug!(
                "Loaded pairing state: device {} with {} paired peers",
                file.device_id,
                devices.len()
            );

            Ok(Self {
                path,
                device_id: file.device_id,
                keypair,
                inner: RwLock::new(Inner {
                    devices,
                    pending: HashMap::new(),
                }),
            })
        } else {
            let store = Self {
                path,
                device_id: random_id(),
                keypair: KeyPair::generate(),
                inner: RwLock::new(Inner {
                    devices: HashMap::new(),
                    pending: HashMap::new(),
                }),
            };
            info!("Generated new device identity {}", store.device_id);
            store.persist(&store.inner.read().unwrap_or_else(|e| e.into_inner()))?;
            Ok(store)
        }
    }

    /// The stable opaque identifier of this device
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// This device's public key in wire encoding
    pub fn public_key_b64(&self) -> String {
        self.keypair.public_key_b64()
    }

    /// Confirmation code for this device's key and a peer's key
    pub fn confirm_code_with(&self, peer_public_b64: &str) -> Result<String> {
        let peer = crypto::decode_public_key(peer_public_b64)?;
        Ok(crypto::confirm_code(&self.keypair.public_key_bytes(), &peer))
    }

    /// Record an inbound `pair-init`, generating a challenge id and the
    /// confirmation code. Fails if the peer key does not decode.
    pub fn create_pending(
        &self,
        peer_id: &str,
        label: &str,
        peer_public_b64: &str,
        address: &str,
    ) -> Result<PendingPairing> {
        let confirm_code = self.confirm_code_with(peer_public_b64)?;

        let pending = PendingPairing {
            challenge_id: random_id(),
            peer_id: peer_id.to_string(),
            label: label.to_string(),
            public_key: peer_public_b64.to_string(),
            address: address.to_string(),
            confirm_code,
            created_at: now_ms(),
        };

        let mut inner = self.write_lock();
        sweep_expired(&mut inner.pending);
        inner
            .pending
            .insert(pending.challenge_id.clone(), pending.clone());

        Ok(pending)
    }

    /// Currently pending requests, oldest first
    pub fn pending_list(&self) -> Vec<PendingPairing> {
        let mut inner = self.write_lock();
        sweep_expired(&mut inner.pending);
        let mut list: Vec<_> = inner.pending.values().cloned().collect();
        list.sort_by_key(|p| p.created_at);
        list
    }

    /// Consume a pending record, derive the shared secret and store the
    /// paired device. Returns `None` for an unknown or expired challenge.
    pub fn approve(&self, challenge_id: &str) -> Result<Option<PairedDevice>> {
        let mut inner = self.write_lock();
        sweep_expired(&mut inner.pending);

        let pending = match inner.pending.remove(challenge_id) {
            Some(p) => p,
            None => return Ok(None),
        };

        let secret = self.keypair.shared_secret(&pending.public_key)?;
        let now = now_ms();

        let device = PairedDevice {
            peer_id: pending.peer_id.clone(),
            label: pending.label,
            public_key: pending.public_key,
            shared_secret: hex::encode(secret),
            last_address: pending.address,
            paired_at: now,
            last_seen: now,
            trusted: true,
        };

        inner.devices.insert(device.peer_id.clone(), device.clone());
        self.persist(&inner)?;
        info!("Paired with device {} ({})", device.peer_id, device.label);

        Ok(Some(device))
    }

    /// Drop a pending record. Returns whether one was present.
    pub fn reject(&self, challenge_id: &str) -> bool {
        let mut inner = self.write_lock();
        sweep_expired(&mut inner.pending);
        inner.pending.remove(challenge_id).is_some()
    }

    pub fn get(&self, peer_id: &str) -> Option<PairedDevice> {
        self.read_lock().devices.get(peer_id).cloned()
    }

    pub fn list(&self) -> Vec<PairedDevice> {
        let mut list: Vec<_> = self.read_lock().devices.values().cloned().collect();
        list.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        list
    }

    pub fn count(&self) -> usize {
        self.read_lock().devices.len()
    }

    /// Remove a paired device. Returns whether it existed.
    pub fn revoke(&self, peer_id: &str) -> Result<bool> {
        let mut inner = self.write_lock();
        let removed = inner.devices.remove(peer_id).is_some();
        if removed {
            self.persist(&inner)?;
            info!("Revoked pairing with {}", peer_id);
        }
        Ok(removed)
    }

    /// Remove every paired device. Returns how many were dropped.
    pub fn revoke_all(&self) -> Result<usize> {
        let mut inner = self.write_lock();
        let count = inner.devices.len();
        inner.devices.clear();
        if count > 0 {
            self.persist(&inner)?;
            info!("Revoked all {} pairings", count);
        }
        Ok(count)
    }

    /// Record the address a peer was last reached at
    pub fn update_address(&self, peer_id: &str, address: &str) -> Result<bool> {
        let mut inner = self.write_lock();
        match inner.devices.get_mut(peer_id) {
            Some(device) => {
                if device.last_address != address {
                    device.last_address = address.to_string();
                    self.persist(&inner)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mark a peer as seen now. In-memory only; the timestamp rides
    /// along with the next persisted mutation.
    pub fn touch_seen(&self, peer_id: &str) {
        if let Some(device) = self.write_lock().devices.get_mut(peer_id) {
            device.last_seen = now_ms();
        }
    }

    /// Sign a message for an outbound request to a paired peer
    pub fn sign_for(&self, peer_id: &str, message: &str) -> Result<String> {
        let device = self
            .get(peer_id)
            .ok_or_else(|| AgentError::Pairing(format!("unknown peer {}", peer_id)))?;
        crypto::hmac_sign(&device.secret_bytes()?, message)
    }

    fn persist(&self, inner: &Inner) -> Result<()> {
        let mut devices: Vec<_> = inner.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let file = StateFile {
            version: STATE_VERSION,
            device_id: self.device_id.clone(),
            private_key: self.keypair.to_b64(),
            devices: devices
                .into_iter()
                .map(|d| serde_json::to_value(d).unwrap_or_default())
                .collect(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Shift a pending record back in time (expiry tests)
    #[cfg(test)]
    pub fn backdate_pending(&self, challenge_id: &str, created_at: u64) {
        if let Some(p) = self.write_lock().pending.get_mut(challenge_id) {
            p.created_at = created_at;
        }
    }
}

fn sweep_expired(pending: &mut HashMap<String, PendingPairing>) {
    let now = now_ms();
    pending.retain(|_, p| !p.expired_at(now));
}

/// Generate an opaque identifier (16 random bytes, hex)
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
