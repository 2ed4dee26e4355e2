//! URL dispatch for the JSON API
//!
//! Paths follow `/api/<domain>/<action>[/<param>]`. The routing table
//! is declared once here; `ping` and the `peer` domain manage their own
//! authentication (pairing endpoints must be reachable without
//! credentials), everything else goes through the auth gate first.

use crate::auth::AuthGate;
use crate::discovery::PeerBrowser;
use crate::handlers::{
    apps::AppsHandler, contacts::ContactsHandler, device::DeviceHandler, files::FilesHandler,
    orchestrator::OrchestratorHandler, peer::PeerHandler, ping::PingHandler, shell::ShellHandler,
    sms::SmsHandler,
};
use crate::http::{Request, Response};
use crate::lifecycle::Counters;
use crate::orchestrator::Orchestrator;
use crate::pairing::PairingStore;
use crate::providers::Providers;
use std::sync::Arc;
use tracing::error;

pub struct Router {
    gate: Arc<AuthGate>,
    ping: PingHandler,
    device: DeviceHandler,
    files: FilesHandler,
    apps: AppsHandler,
    contacts: ContactsHandler,
    sms: SmsHandler,
    shell: ShellHandler,
    peer: PeerHandler,
    orchestrator: OrchestratorHandler,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gate: Arc<AuthGate>,
        store: Arc<PairingStore>,
        providers: Providers,
        orchestrator: Arc<Orchestrator>,
        counters: Arc<Counters>,
        browser: Option<Arc<PeerBrowser>>,
        label: String,
    ) -> Self {
        Self {
            ping: PingHandler::new(Arc::clone(&store), label.clone()),
            device: DeviceHandler::new(Arc::clone(&providers.device)),
            files: FilesHandler::new(Arc::clone(&providers.files)),
            apps: AppsHandler::new(Arc::clone(&providers.apps)),
            contacts: ContactsHandler::new(Arc::clone(&providers.contacts)),
            sms: SmsHandler::new(Arc::clone(&providers.sms)),
            shell: ShellHandler::new(Arc::clone(&providers.shell)),
            peer: PeerHandler::new(
                Arc::clone(&store),
                Arc::clone(&gate),
                Arc::clone(&providers.security),
                Arc::clone(&providers.files),
                browser,
                label,
            ),
            orchestrator: OrchestratorHandler::new(
                orchestrator,
                store,
                counters,
                providers,
            ),
            gate,
        }
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let segments: Vec<&str> = request
            .path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        if segments.first() != Some(&"api") || segments.len() < 2 {
            return Response::error(404, "not found");
        }

        let domain = segments[1];
        let action = segments.get(2).copied().unwrap_or("");
        let param = segments.get(3).copied();

        // Token enforcement is skipped for ping and the whole peer
        // domain; peer data-plane endpoints re-check in HMAC mode
        // inside the handler.
        if domain != "ping" && domain != "peer" {
            if let Err(failure) = self.gate.verify(&request) {
                return Response::error(failure.status(), &failure.to_string());
            }
        }

        let result = match domain {
            "ping" => Ok(self.ping.handle()),
            "device" => self.device.handle(action, &request),
            "files" => self.files.handle(action, &request),
            "apps" => self.apps.handle(action, param, &request),
            "contacts" => self.contacts.handle(action, &request),
            "sms" => self.sms.handle(action, &request),
            "shell" => self.shell.handle(action, &request).await,
            "peer" => self.peer.handle(action, &request),
            "orchestrator" => self.orchestrator.handle(action, &request).await,
            _ => return Response::error(404, &format!("unknown domain '{}'", domain)),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                if e.status() == 500 {
                    error!("{} {} failed: {}", request.method, request.target, e.message());
                }
                e.into_response()
            }
        }
    }
}
