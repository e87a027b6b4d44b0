//! Contracts for the external systems the pool manager drives.
//!
//! Remote command execution, container orchestration, secret storage, and
//! the device directory all live outside this crate. They are injected as
//! trait objects so the daemon can wire real SSH/Docker backends and tests
//! can wire scripted mocks.
//!
//! The traits return boxed futures rather than using `async fn` so they
//! stay object-safe.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::deployment::DeploymentSpec;

/// Boxed future alias for collaborator calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Command executor ───────────────────────────────────────────────

/// Errors from running a command on a remote device.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command exited with status {status}: {output}")]
    Failed { status: i32, output: String },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Runs shell commands on a device over an authenticated transport.
pub trait CommandExecutor: Send + Sync {
    /// Run `command` on `host`, returning combined output. Implementations
    /// must give up with [`ExecError::Timeout`] once `timeout` elapses.
    fn execute<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String, ExecError>>;
}

// ── Orchestrator ───────────────────────────────────────────────────

/// Errors from the container orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("deploy failed: {0}")]
    Deploy(String),

    #[error("not healthy after {0:?}")]
    HealthTimeout(Duration),

    #[error("unhealthy: {0}")]
    Unhealthy(String),

    #[error("cleanup failed: {0}")]
    Cleanup(String),
}

/// Manages the container lifecycle of a named deployment.
pub trait Orchestrator: Send + Sync {
    /// Start (or converge) the deployment described by `spec`.
    fn deploy<'a>(&'a self, spec: &'a DeploymentSpec) -> BoxFuture<'a, Result<(), OrchestratorError>>;

    /// Block until the named container reports healthy, or `timeout` elapses.
    fn wait_for_healthy<'a>(
        &'a self,
        name: &'a str,
        host: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), OrchestratorError>>;

    /// Stop the deployment and remove its containers, volumes, and files.
    fn remove_with_cleanup<'a>(
        &'a self,
        spec: &'a DeploymentSpec,
    ) -> BoxFuture<'a, Result<(), OrchestratorError>>;
}

// ── Vault ──────────────────────────────────────────────────────────

/// Errors from the secret vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("vault backend: {0}")]
    Backend(String),
}

/// Opaque secret storage. The pool only ever persists the key.
pub trait Vault: Send + Sync {
    fn store<'a>(&'a self, key: &'a str, secret: &'a str) -> BoxFuture<'a, Result<(), VaultError>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<String, VaultError>>;

    /// Remove a secret. Removing a missing key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), VaultError>>;
}

// ── Device directory ───────────────────────────────────────────────

/// Network-reachable host strings for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    /// Address applications connect to.
    pub address: String,
    /// Host string handed to the [`CommandExecutor`].
    pub ssh_host: String,
}

/// Errors from the device directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("unknown device: {0}")]
    NotFound(String),

    #[error("directory backend: {0}")]
    Backend(String),
}

/// Resolves device identifiers to host strings.
pub trait DeviceDirectory: Send + Sync {
    fn get_device<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<DeviceEndpoint, DirectoryError>>;
}
