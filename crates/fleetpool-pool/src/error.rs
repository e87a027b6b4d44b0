//! Resource pool error types.

use std::fmt;

use thiserror::Error;

use crate::collaborators::{DirectoryError, ExecError, OrchestratorError, VaultError};

/// The step of `ensure_resource_for_app` an error surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    InstanceCreation,
    Deployment,
    HealthCheck,
    Provisioning,
    Release,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::InstanceCreation => "instance creation",
            Stage::Deployment => "deployment",
            Stage::HealthCheck => "health check",
            Stage::Provisioning => "per-app provisioning",
            Stage::Release => "release",
        })
    }
}

/// Errors that can occur while managing shared resource pools.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("password generation failed: {0}")]
    GenerationFailed(String),

    #[error("encoded password too short: wanted {wanted} characters, got {got}")]
    EncodingTooShort { wanted: usize, got: usize },

    #[error("no free port on {device} after {attempts} attempts")]
    AllocationExhausted { device: String, attempts: u32 },

    #[error("no ports available on {device}: probing ran past 65535")]
    NoPortsAvailable { device: String },

    #[error("all {max_slots} slots in use on instance {instance}")]
    SlotsExhausted { instance: String, max_slots: u32 },

    #[error("engine {0} does not support numbered databases")]
    UnsupportedByEngine(String),

    /// Another caller created the instance and has not finished deploying it.
    #[error("shared {engine} on {device} is not yet running")]
    NotYetRunning { device: String, engine: String },

    /// Another caller is provisioning the same app right now.
    #[error("{app} is still being provisioned on {engine}")]
    ResourceBusy { app: String, engine: String },

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("health check timed out: {0}")]
    HealthCheckTimeout(String),

    #[error("remote command failed: {0}")]
    RemoteCommandFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("vault error: {0}")]
    Vault(String),

    #[error("state store error: {0}")]
    State(#[from] fleetpool_state::StateError),

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        source: Box<PoolError>,
    },
}

pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Wrap the error with the stage it surfaced from. Already-staged errors
    /// keep their original stage.
    pub fn at(self, stage: Stage) -> Self {
        match self {
            PoolError::Stage { .. } => self,
            other => PoolError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was tagged with, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PoolError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The underlying error with any stage wrapper removed.
    pub fn root(&self) -> &PoolError {
        match self {
            PoolError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether retrying the same call later can succeed without the input
    /// changing.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            PoolError::InvalidParameter(_)
            | PoolError::UnsupportedByEngine(_)
            | PoolError::EncodingTooShort { .. } => false,
            PoolError::NotFound(_) => false,
            _ => true,
        }
    }
}

impl From<ExecError> for PoolError {
    fn from(e: ExecError) -> Self {
        PoolError::RemoteCommandFailed(e.to_string())
    }
}

impl From<VaultError> for PoolError {
    fn from(e: VaultError) -> Self {
        PoolError::Vault(e.to_string())
    }
}

impl From<DirectoryError> for PoolError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(id) => PoolError::NotFound(format!("device {id}")),
            DirectoryError::Backend(msg) => PoolError::RemoteCommandFailed(msg),
        }
    }
}

impl From<OrchestratorError> for PoolError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::HealthTimeout(_) | OrchestratorError::Unhealthy(_) => {
                PoolError::HealthCheckTimeout(e.to_string())
            }
            _ => PoolError::DeploymentFailed(e.to_string()),
        }
    }
}
