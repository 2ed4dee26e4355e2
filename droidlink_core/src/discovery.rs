//! mDNS peer discovery
//!
//! Advertises the agent's HTTP endpoint as `_adbtoolkit._tcp` and
//! browses for other agents on the link. Discovery is advisory only:
//! knowing an address never grants access, pairing still runs the full
//! protocol.

use crate::error::{AgentError, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// The mDNS service type for agent discovery
pub const SERVICE_TYPE: &str = "_adbtoolkit._tcp.local.";

/// An agent instance seen on the local network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub instance_name: String,
    pub device_id: String,
    pub label: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

impl DiscoveredPeer {
    /// Socket address of the peer's JSON API. IPv4 wins when the peer
    /// announced both families; `None` when no address was resolved.
    pub fn http_addr(&self) -> Option<std::net::SocketAddr> {
        let ip = self
            .addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| self.addresses.first())?;
        Some(std::net::SocketAddr::new(*ip, self.port))
    }
}

/// Events emitted while browsing
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerFound(DiscoveredPeer),
    PeerLost(String), // instance name
    SearchStarted,
    SearchStopped,
}

/// Advertises this agent on the link
pub struct AgentAdvertiser {
    daemon: ServiceDaemon,
    service_fullname: Option<String>,
}

impl AgentAdvertiser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| AgentError::Discovery(format!("failed to create mDNS daemon: {}", e)))?;

        Ok(Self {
            daemon,
            service_fullname: None,
        })
    }

    /// Start advertising. The instance name derives from the device id
    /// so it stays stable across restarts; the label and id travel in
    /// TXT records.
    pub fn advertise(&mut self, device_id: &str, label: &str, port: u16) -> Result<()> {
        let id_prefix: String = device_id.chars().take(8).collect();
        let instance_name = format!("droidlink-{}", id_prefix);
        let service_hostname = format!("{}.local.", local_hostname()?);

        let mut properties = HashMap::new();
        properties.insert("device_id".to_string(), device_id.to_string());
        properties.insert("label".to_string(), label.to_string());
        properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        let ip = advertised_addresses()?
            .into_iter()
            .next()
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &service_hostname,
            ip,
            port,
            properties,
        )
        .map_err(|e| AgentError::Discovery(format!("failed to create service info: {}", e)))?;

        let fullname = service_info.get_fullname().to_string();

        self.daemon
            .register(service_info)
            .map_err(|e| AgentError::Discovery(format!("failed to register service: {}", e)))?;

        self.service_fullname = Some(fullname.clone());
        info!("Advertising service: {}", fullname);

        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(fullname) = self.service_fullname.take() {
            self.daemon
                .unregister(&fullname)
                .map_err(|e| AgentError::Discovery(format!("failed to unregister: {}", e)))?;
            info!("Stopped advertising service");
        }
        Ok(())
    }
}

impl Drop for AgentAdvertiser {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Browses for other agents and keeps the name → peer map current
pub struct PeerBrowser {
    daemon: ServiceDaemon,
    peers: Arc<Mutex<HashMap<String, DiscoveredPeer>>>,
}

impl PeerBrowser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| AgentError::Discovery(format!("failed to create mDNS daemon: {}", e)))?;

        Ok(Self {
            daemon,
            peers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Start browsing; add/remove events arrive on the returned channel
    pub fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| AgentError::Discovery(format!("failed to browse: {}", e)))?;

        let (tx, rx) = mpsc::channel(100);
        let peers = Arc::clone(&self.peers);

        // The mdns-sd receiver is synchronous; drain it on a dedicated
        // thread and forward into the async channel
        std::thread::spawn(move || {
            while let Ok(event) = receiver.recv() {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let peer = DiscoveredPeer {
                            instance_name: info.get_fullname().to_string(),
                            device_id: info
                                .get_property_val_str("device_id")
                                .unwrap_or_default()
                                .to_string(),
                            label: info
                                .get_property_val_str("label")
                                .unwrap_or_default()
                                .to_string(),
                            addresses: info.get_addresses().iter().copied().collect(),
                            port: info.get_port(),
                        };

                        debug!("Discovered peer: {:?}", peer);

                        {
                            let mut map = peers.lock().unwrap();
                            map.insert(peer.instance_name.clone(), peer.clone());
                        }

                        if tx.blocking_send(DiscoveryEvent::PeerFound(peer)).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        {
                            let mut map = peers.lock().unwrap();
                            map.remove(&fullname);
                        }
                        if tx.blocking_send(DiscoveryEvent::PeerLost(fullname)).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::SearchStarted(_) => {
                        debug!("mDNS search started");
                        let _ = tx.blocking_send(DiscoveryEvent::SearchStarted);
                    }
                    ServiceEvent::SearchStopped(_) => {
                        debug!("mDNS search stopped");
                        let _ = tx.blocking_send(DiscoveryEvent::SearchStopped);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(rx)
    }

    /// Currently known peers
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        let peers = self.peers.lock().unwrap();
        peers.values().cloned().collect()
    }

    /// Drain browse events until `duration` passes (or the search is
    /// stopped underneath us), then report the peers seen.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredPeer>> {
        let mut events = self.browse()?;
        let deadline = tokio::time::Instant::now() + duration;

        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            if matches!(event, DiscoveryEvent::SearchStopped) {
                break;
            }
        }

        Ok(self.peers())
    }
}

/// The hostname mDNS registrations are published under
pub fn local_hostname() -> Result<String> {
    let name = hostname::get()
        .map_err(|e| AgentError::Discovery(format!("hostname lookup failed: {}", e)))?;
    Ok(name.to_string_lossy().into_owned())
}

/// Non-loopback interface addresses usable in advertisements
pub fn advertised_addresses() -> Result<Vec<IpAddr>> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| AgentError::Discovery(format!("interface enumeration failed: {}", e)))?;

    Ok(interfaces
        .into_iter()
        .map(|(_, ip)| ip)
        .filter(|ip| !ip.is_loopback())
        .collect())
}
