//! Identity command - show the device id and public key

use crate::config::Config;
use anyhow::{Context, Result};
use droidlink_core::pairing::PairingStore;
use std::path::PathBuf;

use super::field;

pub fn run(data_dir: Option<PathBuf>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(dir) = data_dir {
        config.data_dir = Some(dir);
    }
    let data_dir = config.resolve_data_dir()?;

    let store = PairingStore::open(data_dir.join("pairing_state.json"))
        .context("failed to open pairing state")?;

    field("Device id", store.device_id());
    field("Public key", store.public_key_b64());
    field("Paired", format!("{} device(s)", store.count()));
    field("State dir", data_dir.display());

    Ok(())
}
