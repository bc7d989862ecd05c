//! Shared application state.

use std::collections::HashSet;
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::shutdown::ShutdownController;
use crate::ws::Hub;

/// State shared by the HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    /// Token validator for the upgrade surface
    pub authenticator: Arc<Authenticator>,
    /// Handle to the hub event loop
    pub hub: Hub,
    /// Allowed WebSocket origins; empty means unrestricted
    pub allowed_origins: HashSet<String>,
    /// Per-client outbound queue capacity
    pub client_buffer: usize,
    /// Root shutdown scope; every session derives from it
    pub shutdown: ShutdownController,
}

impl AppState {
    /// Creates the shared state from configuration and wired components.
    #[must_use]
    pub fn new(
        config: &Config,
        authenticator: Arc<Authenticator>,
        hub: Hub,
        shutdown: ShutdownController,
    ) -> Self {
        Self {
            authenticator,
            hub,
            allowed_origins: config
                .allowed_origins
                .iter()
                .map(|origin| origin.trim())
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect(),
            client_buffer: config.client_buffer,
            shutdown,
        }
    }
}
