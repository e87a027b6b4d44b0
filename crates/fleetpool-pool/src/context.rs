//! Shared handles every pool component works through.

use std::sync::Arc;

use fleetpool_state::StateStore;

use crate::collaborators::{CommandExecutor, DeviceDirectory, Orchestrator, Vault};
use crate::config::PoolConfig;
use crate::engine::EngineCatalog;
use crate::locks::ScopeLocks;

/// Store, locks, collaborators, and configuration, cheaply cloneable.
#[derive(Clone)]
pub struct PoolContext {
    pub store: StateStore,
    pub locks: ScopeLocks,
    pub executor: Arc<dyn CommandExecutor>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub vault: Arc<dyn Vault>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub catalog: Arc<EngineCatalog>,
    pub config: Arc<PoolConfig>,
}

impl PoolContext {
    pub fn new(
        store: StateStore,
        executor: Arc<dyn CommandExecutor>,
        orchestrator: Arc<dyn Orchestrator>,
        vault: Arc<dyn Vault>,
        directory: Arc<dyn DeviceDirectory>,
    ) -> Self {
        Self {
            store,
            locks: ScopeLocks::new(),
            executor,
            orchestrator,
            vault,
            directory,
            catalog: Arc::new(EngineCatalog::builtin()),
            config: Arc::new(PoolConfig::default()),
        }
    }

    pub fn with_catalog(mut self, catalog: EngineCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}
