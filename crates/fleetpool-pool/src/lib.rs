//! fleetpool-pool: shared database and cache pools across fleet devices.
//!
//! Instead of one database or cache container per app, each device runs at
//! most one shared instance per engine and every app gets an isolated
//! database/user or cache namespace inside it.
//!
//! # Architecture
//!
//! ```text
//! ResourcePoolManager (one per family)
//!   ├── SharedInstanceRegistry  ── get-or-create, rollback, stale reaping
//!   │     └── PortAllocator     ── claimed ports + live check on the device
//!   └── ResourceProvisioner     ── per-app database / ACL user / slot
//!         └── SlotAllocator     ── numbered databases 0..max_slots
//! ```
//!
//! Remote execution, container orchestration, secret storage, and device
//! lookup are injected through the traits in [`collaborators`].

pub mod collaborators;
pub mod config;
pub mod context;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod locks;
pub mod manager;
pub mod password;
pub mod ports;
pub mod provisioner;
pub mod registry;
pub mod slots;
pub mod stats;

#[cfg(test)]
mod test_utils;

use std::time::{SystemTime, UNIX_EPOCH};

pub use collaborators::{
    BoxFuture, CommandExecutor, DeviceDirectory, DeviceEndpoint, DirectoryError, ExecError,
    Orchestrator, OrchestratorError, Vault, VaultError,
};
pub use config::{PoolConfig, parse_duration};
pub use context::PoolContext;
pub use deployment::DeploymentSpec;
pub use engine::{Engine, EngineCatalog, EngineOverride, EngineSettings};
pub use error::{PoolError, PoolResult, Stage};
pub use manager::ResourcePoolManager;
pub use password::generate_secure_password;
pub use provisioner::ConnectionInfo;
pub use stats::{InstanceUsage, PoolStats};

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
