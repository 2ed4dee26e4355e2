//! Agent lifecycle: configuration, counters, start/stop
//!
//! The controller owns the configuration and the process-wide token,
//! starts the HTTP, transfer and discovery services together and stops
//! them together. In-flight work is cancelled by closing the listener
//! sockets and flipping the shutdown signal.

use crate::auth::AuthGate;
use crate::discovery::{AgentAdvertiser, DiscoveryEvent, PeerBrowser};
use crate::error::Result;
use crate::http::{HttpService, DEFAULT_HTTP_PORT};
use crate::orchestrator::Orchestrator;
use crate::pairing::PairingStore;
use crate::providers::Providers;
use crate::router::Router;
use crate::transfer::{TransferService, DEFAULT_TRANSFER_PORT};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Process-wide transfer and connection counters. Reporting only.
#[derive(Debug, Default)]
pub struct Counters {
    total_bytes_transferred: AtomicU64,
    active_transfers: AtomicU64,
    connected_clients: AtomicU64,
}

impl Counters {
    pub fn add_bytes(&self, n: u64) {
        self.total_bytes_transferred.fetch_add(n, Ordering::Relaxed);
    }

    pub fn transfer_started(&self) {
        self.active_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_finished(&self) {
        self.active_transfers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "total_bytes_transferred": self.total_bytes_transferred.load(Ordering::Relaxed),
            "active_transfers": self.active_transfers.load(Ordering::Relaxed),
            "connected_clients": self.connected_clients.load(Ordering::Relaxed),
        })
    }
}

/// Agent configuration. Ports of 0 bind ephemeral ports (tests).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind_addr: IpAddr,
    pub http_port: u16,
    pub transfer_port: u16,
    pub data_dir: PathBuf,
    pub label: String,
    /// Overrides the persisted token when set
    pub token: Option<String>,
    pub sandbox_root: Option<PathBuf>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub enable_discovery: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            http_port: DEFAULT_HTTP_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            data_dir: PathBuf::from("."),
            label: crate::hostname(),
            token: None,
            sandbox_root: None,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(60),
            enable_discovery: true,
        }
    }
}

/// Starts and owns the running services
pub struct LifecycleController {
    store: Arc<PairingStore>,
    counters: Arc<Counters>,
    token: Arc<RwLock<String>>,
    token_path: PathBuf,
    http_addr: SocketAddr,
    transfer_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    advertiser: Option<AgentAdvertiser>,
}

impl LifecycleController {
    /// Bring up the whole agent: pairing store, auth, HTTP + transfer
    /// listeners, and (optionally) mDNS advertisement and browsing.
    pub async fn start(config: AgentConfig, providers: Providers) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(PairingStore::open(config.data_dir.join("pairing_state.json"))?);
        let token_path = config.data_dir.join("auth_token");
        let token_value = match &config.token {
            Some(token) => token.clone(),
            None => load_or_create_token(&token_path)?,
        };
        let token = Arc::new(RwLock::new(token_value));

        let gate = Arc::new(AuthGate::new(Arc::clone(&token), Arc::clone(&store)));
        let counters = Arc::new(Counters::default());
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store)));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // Discovery is advisory; failures downgrade to a warning
        let mut advertiser = None;
        let mut browser = None;
        if config.enable_discovery {
            match PeerBrowser::new() {
                Ok(b) => {
                    let b = Arc::new(b);
                    match b.browse() {
                        Ok(events) => {
                            tasks.push(spawn_address_tracker(
                                events,
                                Arc::clone(&store),
                                shutdown_rx.clone(),
                            ));
                            browser = Some(Arc::clone(&b));
                        }
                        Err(e) => warn!("mDNS browse failed: {}", e),
                    }
                }
                Err(e) => warn!("mDNS unavailable: {}", e),
            }
        }

        let router = Arc::new(Router::new(
            Arc::clone(&gate),
            Arc::clone(&store),
            providers.clone(),
            orchestrator,
            Arc::clone(&counters),
            browser,
            config.label.clone(),
        ));

        let http_listener =
            TcpListener::bind(SocketAddr::new(config.bind_addr, config.http_port)).await?;
        let http_addr = http_listener.local_addr()?;

        // The transfer listener is bound with raised socket buffers;
        // accepted transfer connections inherit them.
        let transfer_listener =
            crate::transfer::bind_listener(SocketAddr::new(config.bind_addr, config.transfer_port))?;
        let transfer_addr = transfer_listener.local_addr()?;

        let http_service = HttpService::new(Arc::clone(&router), Arc::clone(&counters))
            .with_timeouts(config.read_timeout, config.write_timeout);
        tasks.push(tokio::spawn(
            http_service.run(http_listener, shutdown_rx.clone()),
        ));

        let transfer_service = TransferService::new(
            Arc::clone(&gate),
            Arc::clone(&providers.files),
            Arc::clone(&counters),
        );
        tasks.push(tokio::spawn(
            transfer_service.run(transfer_listener, shutdown_rx),
        ));

        if config.enable_discovery {
            match AgentAdvertiser::new() {
                Ok(mut adv) => {
                    if let Err(e) =
                        adv.advertise(store.device_id(), &config.label, http_addr.port())
                    {
                        warn!("mDNS advertisement failed: {}", e);
                    } else {
                        advertiser = Some(adv);
                    }
                }
                Err(e) => warn!("mDNS unavailable: {}", e),
            }
        }

        info!(
            "Agent up: device {} http={} transfer={}",
            store.device_id(),
            http_addr,
            transfer_addr
        );

        Ok(Self {
            store,
            counters,
            token,
            token_path,
            http_addr,
            transfer_addr,
            shutdown,
            tasks,
            advertiser,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        self.transfer_addr
    }

    pub fn device_id(&self) -> String {
        self.store.device_id().to_string()
    }

    pub fn store(&self) -> Arc<PairingStore> {
        Arc::clone(&self.store)
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    pub fn token(&self) -> String {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the controller token and persist it
    pub fn set_token(&self, new_token: &str) -> Result<()> {
        {
            let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
            *guard = new_token.to_string();
        }
        write_token_file(&self.token_path, new_token)
    }

    pub fn status(&self) -> serde_json::Value {
        let mut status = self.counters.snapshot();
        status["paired_devices"] = serde_json::json!(self.store.count());
        status["http_addr"] = serde_json::json!(self.http_addr.to_string());
        status["transfer_addr"] = serde_json::json!(self.transfer_addr.to_string());
        status
    }

    /// Stop accepting, close the listeners and wait (bounded) for
    /// in-flight tasks.
    pub async fn stop(mut self) {
        if let Some(mut adv) = self.advertiser.take() {
            let _ = adv.stop();
        }
        let _ = self.shutdown.send(true);

        for task in self.tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("Task did not stop within the join period");
            }
        }
        info!("Agent stopped");
    }
}

/// Keep paired-device addresses fresh from mDNS sightings
fn spawn_address_tracker(
    mut events: tokio::sync::mpsc::Receiver<DiscoveryEvent>,
    store: Arc<PairingStore>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => {
                    match event {
                        Some(DiscoveryEvent::PeerFound(peer)) => {
                            if store.get(&peer.device_id).is_some() {
                                if let Some(addr) = peer.http_addr() {
                                    let _ =
                                        store.update_address(&peer.device_id, &addr.to_string());
                                }
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
    })
}

/// Read the persisted controller token, generating one on first run
pub fn load_or_create_token(path: &std::path::Path) -> Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        return Ok(token);
    }

    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    let token = hex::encode(bytes);
    write_token_file(path, &token)?;
    info!("Generated new controller token");
    Ok(token)
}

/// Persist the controller token with owner-only permissions
pub fn write_token_file(path: &std::path::Path, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
