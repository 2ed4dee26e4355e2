//! Token command - show or rotate the controller token

use crate::config::Config;
use anyhow::{Context, Result};
use droidlink_core::lifecycle::{load_or_create_token, write_token_file};
use std::path::PathBuf;

use super::{done, field};

pub fn run(rotate: bool, data_dir: Option<PathBuf>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(dir) = data_dir {
        config.data_dir = Some(dir);
    }
    let token_path = config.resolve_data_dir()?.join("auth_token");
    std::fs::create_dir_all(token_path.parent().unwrap_or(std::path::Path::new(".")))
        .context("failed to create data dir")?;

    if rotate {
        let mut bytes = [0u8; 16];
        use rand::Rng;
        rand::thread_rng().fill(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

        write_token_file(&token_path, &token).context("failed to write token")?;
        done("Token rotated");
        field("Token", token);
        return Ok(());
    }

    let token = load_or_create_token(&token_path).context("failed to read token")?;
    field("Token", token);
    println!("Send it as the X-Agent-Token header (or ?token= query)");

    Ok(())
}
