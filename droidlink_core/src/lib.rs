//! Droidlink Core Library
//!
//! This crate provides the on-device agent core for the droidlink
//! toolkit: a paired controller talks to it over USB-forwarded loopback
//! or Wi-Fi for device introspection, file and package operations, bulk
//! binary transfer and secure peer-to-peer relay.
//!
//! # Architecture
//!
//! The library is organized around a handful of cooperating services:
//!
//! - [`crypto`]: P-256 key agreement, HMAC request signatures and the
//!   pairing confirmation code
//! - [`pairing`]: persisted paired-device records and the pending table
//! - [`auth`]: token and peer-signature authentication
//! - [`http`]: the hand-parsed HTTP/1.1 request/reply surface
//! - [`router`] and [`handlers`]: the `/api/<domain>/<action>` dispatch
//! - [`transfer`]: the framed binary channel for bulk file movement
//! - [`discovery`]: mDNS advertisement and peer lookup via `mdns-sd`
//! - [`orchestrator`]: outbound signed requests to paired peers
//! - [`lifecycle`]: configuration and start/stop of everything above
//!
//! # Example
//!
//! ```no_run
//! use droidlink_core::host::host_providers;
//! use droidlink_core::lifecycle::{AgentConfig, LifecycleController};
//!
//! async fn run_agent() -> droidlink_core::Result<()> {
//!     let config = AgentConfig {
//!         label: "My Phone".to_string(),
//!         ..AgentConfig::default()
//!     };
//!     let providers = host_providers(config.sandbox_root.clone());
//!
//!     let agent = LifecycleController::start(config, providers).await?;
//!     println!("listening on {}", agent.http_addr());
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     agent.stop().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod host;
pub mod http;
pub mod lifecycle;
pub mod orchestrator;
pub mod pairing;
pub mod providers;
pub mod router;
pub mod transfer;

// Re-export commonly used types
pub use auth::{AuthGate, Verdict};
pub use discovery::{AgentAdvertiser, DiscoveredPeer, DiscoveryEvent, PeerBrowser, SERVICE_TYPE};
pub use error::{AgentError, Result};
pub use http::{DEFAULT_HTTP_PORT, Request, Response};
pub use lifecycle::{AgentConfig, Counters, LifecycleController};
pub use pairing::{PairedDevice, PairingStore, PendingPairing};
pub use transfer::{ClientAuth, TransferClient, DEFAULT_TRANSFER_PORT};

/// Get the version of the droidlink_core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Best-effort hostname, used for default device labels
pub fn hostname() -> String {
    discovery::local_hostname().unwrap_or_else(|_| "droidlink".to_string())
}
