use std::sync::Arc;

use catalyst_core::bus::ClusterBus;
use catalyst_core::config::Config;
use catalyst_core::directory::StreamDirectory;
use catalyst_core::ratelimit::DirectoryLookupLimiter;
use catalyst_core::registry::NodeRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: NodeRegistry,
    pub bus: Arc<dyn ClusterBus>,
    pub directory: Arc<dyn StreamDirectory>,
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub lookup_limiter: Arc<DirectoryLookupLimiter>,
}

impl AppState {
    #[must_use]
    pub fn own_node_name(&self) -> &str {
        &self.config.node.name
    }
}
