//! Droidlink agent daemon
//!
//! Usage:
//!   droidlink-agent run        - Start the agent services
//!   droidlink-agent identity   - Show this device's identity
//!   droidlink-agent token      - Show or rotate the controller token
//!   droidlink-agent status     - Query a running agent
//!   droidlink-agent scan       - Look for other agents nearby

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Droidlink - on-device agent for the droidlink toolkit
#[derive(Parser)]
#[command(name = "droidlink-agent")]
#[command(version)]
#[command(about = "On-device agent: JSON API, bulk transfer and peer-to-peer pairing")]
#[command(long_about = r#"
The agent exposes two listeners on the local network (or a USB-forwarded
loopback): an HTTP JSON API on port 15555 and a bulk transfer channel on
port 15556. Controllers authenticate with the token shown by
`droidlink-agent token`; other agents pair via ECDH with a 6-digit
confirmation code.
"#)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent services (run on the device)
    Run {
        /// HTTP API port
        #[arg(long)]
        http_port: Option<u16>,

        /// Transfer channel port
        #[arg(long)]
        transfer_port: Option<u16>,

        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Human-readable device label (defaults to hostname)
        #[arg(short, long)]
        label: Option<String>,

        /// State directory for pairing and token files
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Confine file operations to this directory
        #[arg(long)]
        sandbox_root: Option<PathBuf>,

        /// Disable mDNS advertisement and browsing
        #[arg(long)]
        no_discovery: bool,
    },

    /// Print the device id, public key and state paths
    Identity {
        /// State directory (defaults to the platform data dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the controller token, or rotate it
    Token {
        /// Generate and persist a fresh token
        #[arg(long)]
        rotate: bool,

        /// State directory (defaults to the platform data dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Query a running local agent
    Status {
        /// HTTP API port of the running agent
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Look for other agents on the local network
    Scan {
        /// How long to scan in seconds
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            http_port,
            transfer_port,
            bind,
            label,
            data_dir,
            sandbox_root,
            no_discovery,
        } => {
            commands::run::run(
                http_port,
                transfer_port,
                bind,
                label,
                data_dir,
                sandbox_root,
                no_discovery,
            )
            .await
        }
        Commands::Identity { data_dir } => commands::identity::run(data_dir),
        Commands::Token { rotate, data_dir } => commands::token::run(rotate, data_dir),
        Commands::Status { port } => commands::status::run(port).await,
        Commands::Scan { timeout } => commands::scan::run(timeout).await,
    }
}
