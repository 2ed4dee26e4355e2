//! Run command - start the agent services

use crate::config::Config;
use anyhow::{Context, Result};
use colored::Colorize;
use droidlink_core::host::host_providers;
use droidlink_core::lifecycle::{AgentConfig, LifecycleController};
use std::path::PathBuf;

use super::{done, field};

#[allow(clippy::too_many_arguments)]
pub async fn run(
    http_port: Option<u16>,
    transfer_port: Option<u16>,
    bind: Option<String>,
    label: Option<String>,
    data_dir: Option<PathBuf>,
    sandbox_root: Option<PathBuf>,
    no_discovery: bool,
) -> Result<()> {
    let mut file_config = Config::load()?;
    if let Some(dir) = data_dir {
        file_config.data_dir = Some(dir);
    }
    if let Some(root) = sandbox_root {
        file_config.sandbox_root = Some(root);
    }

    let bind_addr = bind
        .unwrap_or_else(|| file_config.bind.clone())
        .parse()
        .context("invalid bind address")?;

    let config = AgentConfig {
        bind_addr,
        http_port: http_port.unwrap_or(file_config.http_port),
        transfer_port: transfer_port.unwrap_or(file_config.transfer_port),
        data_dir: file_config.resolve_data_dir()?,
        label: label
            .or_else(|| file_config.label.clone())
            .unwrap_or_else(droidlink_core::hostname),
        token: None,
        sandbox_root: file_config.sandbox_root.clone(),
        enable_discovery: file_config.discovery && !no_discovery,
        ..AgentConfig::default()
    };

    println!();
    println!("{}", "  DROIDLINK AGENT  ".on_bright_cyan().white().bold());
    println!();

    let providers = host_providers(config.sandbox_root.clone());
    let agent = LifecycleController::start(config, providers)
        .await
        .context("failed to start agent")?;

    done("Agent started");
    field("Device id", agent.device_id());
    field("HTTP API", agent.http_addr());
    field("Transfer", agent.transfer_addr());
    println!();
    println!("Press Ctrl-C to stop");
    println!();

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;

    println!();
    agent.stop().await;
    done("Agent stopped");

    Ok(())
}
