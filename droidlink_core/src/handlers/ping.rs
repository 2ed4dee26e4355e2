//! Liveness probe and capability disclosure. Never authenticated.

use crate::http::Response;
use crate::pairing::PairingStore;
use std::sync::Arc;

pub struct PingHandler {
    store: Arc<PairingStore>,
    label: String,
}

impl PingHandler {
    pub fn new(store: Arc<PairingStore>, label: String) -> Self {
        Self { store, label }
    }

    pub fn handle(&self) -> Response {
        Response::ok_json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
            "device_id": self.store.device_id(),
            "label": self.label,
            "paired_devices": self.store.count(),
        }))
    }
}
