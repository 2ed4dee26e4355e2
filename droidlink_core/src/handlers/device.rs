//! Read-only device introspection

use super::{ApiError, HandlerResult};
use crate::http::{Request, Response};
use crate::providers::DeviceProvider;
use std::sync::Arc;

pub struct DeviceHandler {
    provider: Arc<dyn DeviceProvider>,
}

impl DeviceHandler {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self { provider }
    }

    pub fn handle(&self, action: &str, _request: &Request) -> HandlerResult {
        match action {
            "info" => {
                let info = self.provider.info()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "model": info.model,
                    "manufacturer": info.manufacturer,
                    "os": info.os,
                    "os_version": info.os_version,
                    "firmware": info.firmware,
                    "hostname": info.hostname,
                    "agent_version": env!("CARGO_PKG_VERSION"),
                })))
            }
            "battery" => {
                let battery = self.provider.battery()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "level": battery.level,
                    "charging": battery.charging,
                })))
            }
            "network" => {
                let interfaces = self.provider.network()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "interfaces": interfaces,
                })))
            }
            "storage" => {
                let volumes = self.provider.storage()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "volumes": volumes,
                })))
            }
            "props" => {
                let props = self.provider.properties()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "properties": props,
                })))
            }
            "permissions" => {
                let permissions = self.provider.permissions()?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "permissions": permissions,
                })))
            }
            "screen" => {
                let png = self.provider.screenshot_png()?;
                Ok(Response::bytes(200, "image/png", png)
                    .with_header("Content-Disposition", "attachment; filename=\"screen.png\""))
            }
            _ => Err(ApiError::NotFound(format!("unknown device action '{}'", action))),
        }
    }
}
