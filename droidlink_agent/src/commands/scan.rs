//! Scan command - look for other agents on the local network

use anyhow::{Context, Result};
use droidlink_core::discovery::PeerBrowser;
use std::time::Duration;

use super::{done, field};

pub async fn run(timeout: u64) -> Result<()> {
    println!("Scanning for {}s...", timeout);

    let browser = PeerBrowser::new().context("failed to start mDNS browser")?;
    let peers = browser
        .scan(Duration::from_secs(timeout))
        .await
        .context("scan failed")?;

    if peers.is_empty() {
        done("No agents found");
        return Ok(());
    }

    done(&format!("Found {} agent(s)", peers.len()));
    for peer in peers {
        let addr = peer
            .http_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unresolved".to_string());
        field(&peer.label, format!("{} ({})", addr, peer.device_id));
    }

    Ok(())
}
