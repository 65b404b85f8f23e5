//! Process-wide state, constructed once by the binary.

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::server::{ServerDirectory, StaticServerDirectory};

/// Configuration and server directory shared by all devices.
pub struct SatipContext {
    config: ClientConfig,
    servers: Arc<dyn ServerDirectory>,
}

impl SatipContext {
    pub fn new(config: ClientConfig, servers: Arc<dyn ServerDirectory>) -> Arc<Self> {
        Arc::new(Self { config, servers })
    }

    /// Context serving the servers listed in `config`.
    pub fn from_config(config: ClientConfig) -> Arc<Self> {
        let servers = Arc::new(StaticServerDirectory::from_entries(&config.servers));
        Self::new(config, servers)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn servers(&self) -> &Arc<dyn ServerDirectory> {
        &self.servers
    }
}
