//! Scripted collaborators for unit tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleetpool_state::StateStore;

use crate::collaborators::{
    BoxFuture, CommandExecutor, DeviceDirectory, DeviceEndpoint, DirectoryError, ExecError,
    Orchestrator, OrchestratorError, Vault, VaultError,
};
use crate::config::PoolConfig;
use crate::context::PoolContext;
use crate::deployment::DeploymentSpec;
use crate::ports::LISTEN_CHECK;

/// Records every command; answers the listening-socket check from a
/// scripted port set and fails commands containing a configured pattern.
#[derive(Default)]
pub struct MockExecutor {
    calls: Mutex<Vec<(String, String)>>,
    listening: Mutex<HashMap<String, BTreeSet<u16>>>,
    failing: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn listen(&self, host: &str, port: u16) {
        self.listening
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .insert(port);
    }

    pub fn fail_when(&self, pattern: &str) {
        self.failing.lock().unwrap().push(pattern.to_string());
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, cmd)| cmd.contains(pattern))
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }
}

impl CommandExecutor for MockExecutor {
    fn execute<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<String, ExecError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((host.to_string(), command.to_string()));

            if self.failing.lock().unwrap().iter().any(|p| command.contains(p)) {
                return Err(ExecError::Failed {
                    status: 1,
                    output: format!("scripted failure: {command}"),
                });
            }
            if command == LISTEN_CHECK {
                let listening = self.listening.lock().unwrap();
                let lines = listening
                    .get(host)
                    .into_iter()
                    .flatten()
                    .map(|p| format!("0.0.0.0:{p}"))
                    .collect::<Vec<_>>();
                return Ok(lines.join("\n"));
            }
            Ok(String::new())
        })
    }
}

/// Counts lifecycle calls; deploy and health can be made to fail or lag.
#[derive(Default)]
pub struct MockOrchestrator {
    deployed: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    fail_deploy: AtomicBool,
    fail_health: AtomicBool,
    deploy_delay: Mutex<Duration>,
}

impl MockOrchestrator {
    pub fn fail_deploys(&self) {
        self.fail_deploy.store(true, Ordering::SeqCst);
    }

    pub fn fail_health_checks(&self) {
        self.fail_health.store(true, Ordering::SeqCst);
    }

    /// Clear injected failures.
    pub fn heal(&self) {
        self.fail_deploy.store(false, Ordering::SeqCst);
        self.fail_health.store(false, Ordering::SeqCst);
    }

    pub fn delay_deploys(&self, delay: Duration) {
        *self.deploy_delay.lock().unwrap() = delay;
    }

    /// Names of successfully deployed containers.
    pub fn deployed(&self) -> Vec<String> {
        self.deployed.lock().unwrap().clone()
    }

    /// Names passed to `remove_with_cleanup`.
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

impl Orchestrator for MockOrchestrator {
    fn deploy<'a>(&'a self, spec: &'a DeploymentSpec) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move {
            let delay = *self.deploy_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_deploy.load(Ordering::SeqCst) {
                return Err(OrchestratorError::Deploy("scripted deploy failure".into()));
            }
            self.deployed.lock().unwrap().push(spec.name.clone());
            Ok(())
        })
    }

    fn wait_for_healthy<'a>(
        &'a self,
        _name: &'a str,
        _host: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move {
            if self.fail_health.load(Ordering::SeqCst) {
                return Err(OrchestratorError::HealthTimeout(timeout));
            }
            Ok(())
        })
    }

    fn remove_with_cleanup<'a>(
        &'a self,
        spec: &'a DeploymentSpec,
    ) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move {
            self.removed.lock().unwrap().push(spec.name.clone());
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct MemoryVault {
    secrets: Mutex<HashMap<String, String>>,
    rejecting: Mutex<Vec<String>>,
}

impl MemoryVault {
    /// Fail every store whose key contains `pattern`.
    pub fn reject_stores(&self, pattern: &str) {
        self.rejecting.lock().unwrap().push(pattern.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.secrets.lock().unwrap().contains_key(key)
    }

    pub fn secret(&self, key: &str) -> Option<String> {
        self.secrets.lock().unwrap().get(key).cloned()
    }
}

impl Vault for MemoryVault {
    fn store<'a>(&'a self, key: &'a str, secret: &'a str) -> BoxFuture<'a, Result<(), VaultError>> {
        Box::pin(async move {
            if self.rejecting.lock().unwrap().iter().any(|p| key.contains(p)) {
                return Err(VaultError::Backend(format!("scripted failure storing {key}")));
            }
            self.secrets
                .lock()
                .unwrap()
                .insert(key.to_string(), secret.to_string());
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<String, VaultError>> {
        Box::pin(async move {
            self.secret(key)
                .ok_or_else(|| VaultError::NotFound(key.to_string()))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), VaultError>> {
        Box::pin(async move {
            self.secrets.lock().unwrap().remove(key);
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct MemoryDirectory {
    devices: Mutex<HashMap<String, DeviceEndpoint>>,
}

impl MemoryDirectory {
    pub fn add(&self, id: &str, address: &str, ssh_host: &str) {
        self.devices.lock().unwrap().insert(
            id.to_string(),
            DeviceEndpoint {
                address: address.to_string(),
                ssh_host: ssh_host.to_string(),
            },
        );
    }
}

impl DeviceDirectory for MemoryDirectory {
    fn get_device<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<DeviceEndpoint, DirectoryError>> {
        Box::pin(async move {
            self.devices
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
        })
    }
}

/// A pool context over an in-memory store and the mocks above, with
/// devices `dev-1` (`pi@dev-1`, 10.0.0.5) and `dev-2` (`pi@dev-2`, 10.0.0.6).
pub struct Harness {
    pub ctx: PoolContext,
    pub executor: Arc<MockExecutor>,
    pub orchestrator: Arc<MockOrchestrator>,
    pub vault: Arc<MemoryVault>,
    pub directory: Arc<MemoryDirectory>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        let executor = Arc::new(MockExecutor::default());
        let orchestrator = Arc::new(MockOrchestrator::default());
        let vault = Arc::new(MemoryVault::default());
        let directory = Arc::new(MemoryDirectory::default());
        directory.add("dev-1", "10.0.0.5", "pi@dev-1");
        directory.add("dev-2", "10.0.0.6", "pi@dev-2");

        let ctx = PoolContext::new(
            StateStore::open_in_memory().unwrap(),
            executor.clone(),
            orchestrator.clone(),
            vault.clone(),
            directory.clone(),
        )
        .with_config(config);

        Self {
            ctx,
            executor,
            orchestrator,
            vault,
            directory,
        }
    }
}
