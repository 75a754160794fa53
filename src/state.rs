//! Shared application state.

use crate::config::SandboxConfig;
use crate::provider::SandboxProvider;
use crate::registry::SessionRegistry;
use std::sync::Arc;

/// State handed to every request: the session table, the provider and
/// the provisioning settings.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub provider: Arc<dyn SandboxProvider>,
    pub config: Arc<SandboxConfig>,
}

impl AppState {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: SandboxConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            provider,
            config: Arc::new(config),
        }
    }
}
