//! Status command - query a running local agent

use anyhow::Result;
use droidlink_core::orchestrator::http_request;
use droidlink_core::DEFAULT_HTTP_PORT;
use std::time::Duration;

use super::{done, fail, field};

pub async fn run(port: Option<u16>) -> Result<()> {
    let addr = format!("127.0.0.1:{}", port.unwrap_or(DEFAULT_HTTP_PORT));

    match http_request(&addr, "GET", "/api/ping", &[], None, Duration::from_secs(3)).await {
        Ok(answer) if answer.ok() => {
            let body = answer.json();
            done(&format!("Agent is up at {}", addr));
            field("Device id", body["device_id"].as_str().unwrap_or("?"));
            field("Version", body["version"].as_str().unwrap_or("?"));
            field(
                "Paired",
                format!("{} device(s)", body["paired_devices"].as_u64().unwrap_or(0)),
            );
        }
        Ok(answer) => {
            fail(&format!("Agent at {} answered with status {}", addr, answer.status));
        }
        Err(e) => {
            fail(&format!("No agent reachable at {}: {}", addr, e));
        }
    }

    Ok(())
}
