//! Shared instance registry with idempotent get-or-create.
//!
//! At most one instance row exists per `(device, engine)`; the store's
//! unique index enforces it and the device lease makes the
//! check-then-insert race-free in-process. A caller that loses the race to
//! create sees [`PoolError::NotYetRunning`] until the winner has deployed.
//!
//! Rows left in `provisioning` (a crash or cancellation mid-deploy) or in
//! `failed` are treated as abandoned once older than
//! `provisioning_stale_after`: the next get-or-create (or a reconcile pass)
//! tears down whatever container they left and deletes them.

use tracing::{debug, info, warn};
use uuid::Uuid;

use fleetpool_state::{InstanceStatus, ResourceFamily, SharedInstance};

use crate::context::PoolContext;
use crate::deployment::DeploymentSpec;
use crate::engine::{Engine, EngineSettings, container_name_for};
use crate::epoch_secs;
use crate::error::{PoolError, PoolResult};
use crate::password::generate_secure_password;
use crate::ports::PortAllocator;

/// Vault key of an instance's master password.
pub fn master_credential_key(family: ResourceFamily, device_id: &str, engine: Engine) -> String {
    format!("pool/{family}/{device_id}/{engine}/master")
}

/// Persisted record of the shared instances of one resource family.
pub struct SharedInstanceRegistry {
    ctx: PoolContext,
    family: ResourceFamily,
}

impl SharedInstanceRegistry {
    pub fn new(ctx: PoolContext, family: ResourceFamily) -> Self {
        Self { ctx, family }
    }

    /// Return the running instance for `(device_id, engine)`, or create a
    /// new `provisioning` row for the caller to deploy.
    ///
    /// The boolean is true only for the caller that created the row. An
    /// empty `version` selects the engine's default for cache engines and
    /// is rejected for database engines. An empty `name` uses the engine
    /// name.
    pub async fn get_or_create(
        &self,
        device_id: &str,
        engine: &str,
        version: &str,
        name: &str,
    ) -> PoolResult<(SharedInstance, bool)> {
        if device_id.trim().is_empty() {
            return Err(PoolError::InvalidParameter("device id is required".into()));
        }
        let engine = self.ctx.catalog.resolve(engine, self.family)?;
        let settings = self.ctx.catalog.settings(engine)?;
        let version = match version.trim() {
            "" if self.family == ResourceFamily::Database => {
                return Err(PoolError::InvalidParameter(format!(
                    "version is required for {engine}"
                )));
            }
            "" => settings.default_version.clone(),
            v => v.to_string(),
        };
        let name = match name.trim() {
            "" => engine.as_str(),
            n => n,
        };

        if let Some(existing) = self.find(device_id, engine)? {
            if existing.status == InstanceStatus::Running {
                debug!(%device_id, %engine, id = %existing.id, "reusing shared instance");
                return Ok((existing, false));
            }
        }

        let endpoint = self.ctx.directory.get_device(device_id).await?;
        let lease = self.ctx.locks.lock_device(device_id, &endpoint.ssh_host).await;

        // Re-check under the lease; another caller may have won.
        if let Some(existing) = self.find(device_id, engine)? {
            match existing.status {
                InstanceStatus::Running => return Ok((existing, false)),
                _ if self.is_abandoned(&existing) => {
                    self.discard(&existing, lease.ssh_host()).await?;
                }
                _ => {
                    return Err(PoolError::NotYetRunning {
                        device: device_id.to_string(),
                        engine: engine.to_string(),
                    });
                }
            }
        }

        let password = generate_secure_password(self.ctx.config.password_length)?;
        let port = PortAllocator::new(self.ctx.clone())
            .find_available_port(&lease, settings.default_port)
            .await?;
        let credential_ref = master_credential_key(self.family, device_id, engine);

        let instance = SharedInstance {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            family: self.family,
            engine: engine.to_string(),
            version,
            container_name: container_name_for(&self.ctx.config.container_prefix, name),
            port,
            master_username: engine.master_username().map(str::to_string),
            master_credential_ref: credential_ref,
            max_memory_mb: match self.family {
                ResourceFamily::Cache => settings.max_memory_mb,
                ResourceFamily::Database => None,
            },
            status: InstanceStatus::Provisioning,
            error: None,
            resource_count: 0,
            created_at: epoch_secs(),
            deployed_at: None,
        };
        match self.ctx.store.insert_shared_instance(&instance) {
            Ok(()) => {}
            // The engine index already holds a row: a lost race.
            Err(e) if e.is_conflict() => {
                return Err(PoolError::NotYetRunning {
                    device: device_id.to_string(),
                    engine: engine.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.ctx.vault.store(&instance.master_credential_ref, &password).await {
            self.ctx.store.delete_shared_instance(&instance.id)?;
            return Err(e.into());
        }
        drop(lease);

        info!(
            %device_id,
            %engine,
            id = %instance.id,
            port,
            container = %instance.container_name,
            "shared instance created"
        );
        Ok((instance, true))
    }

    /// The instance row for `(device_id, engine)`, in any status.
    pub fn find(&self, device_id: &str, engine: Engine) -> PoolResult<Option<SharedInstance>> {
        Ok(self.ctx.store.find_shared_instance(device_id, engine.as_str())?)
    }

    /// All instances of this family.
    pub fn list(&self) -> PoolResult<Vec<SharedInstance>> {
        Ok(self
            .ctx
            .store
            .list_shared_instances()?
            .into_iter()
            .filter(|i| i.family == self.family)
            .collect())
    }

    /// Transition a deployed instance to `running`.
    pub fn mark_running(&self, instance: &SharedInstance) -> PoolResult<SharedInstance> {
        let mut current = self
            .ctx
            .store
            .get_shared_instance(&instance.id)?
            .ok_or_else(|| PoolError::NotFound(format!("shared instance {}", instance.id)))?;
        current.status = InstanceStatus::Running;
        current.error = None;
        current.deployed_at = Some(epoch_secs());
        self.ctx.store.update_shared_instance(&current)?;
        info!(id = %current.id, engine = %current.engine, device = %current.device_id, "shared instance running");
        Ok(current)
    }

    /// Undo a failed deployment: record the failure, tear the container
    /// down once if one was deployed, then delete the row and its master
    /// secret.
    ///
    /// Cleanup failures are logged; the row is deleted regardless so a
    /// later get-or-create starts fresh.
    pub async fn roll_back(
        &self,
        instance: &SharedInstance,
        deployed: Option<&DeploymentSpec>,
        cause: &PoolError,
    ) {
        let mut failed = instance.clone();
        failed.status = InstanceStatus::Failed;
        failed.error = Some(cause.to_string());
        if let Err(e) = self.ctx.store.update_shared_instance(&failed) {
            warn!(id = %instance.id, error = %e, "could not record instance failure");
        }

        if let Some(spec) = deployed {
            if let Err(e) = self.ctx.orchestrator.remove_with_cleanup(spec).await {
                warn!(id = %instance.id, container = %spec.name, error = %e, "container cleanup failed");
            }
        }
        if let Err(e) = self.ctx.store.delete_shared_instance(&instance.id) {
            warn!(id = %instance.id, error = %e, "could not delete failed instance");
        }
        if let Err(e) = self.ctx.vault.delete(&instance.master_credential_ref).await {
            warn!(id = %instance.id, error = %e, "could not delete master credential");
        }
        warn!(
            id = %instance.id,
            engine = %instance.engine,
            device = %instance.device_id,
            error = %cause,
            "shared instance rolled back"
        );
    }

    /// Remove every abandoned instance of this family. Returns what was
    /// removed.
    pub async fn reap_stale(&self) -> PoolResult<Vec<SharedInstance>> {
        let mut reaped = Vec::new();
        for candidate in self.list()? {
            if candidate.status == InstanceStatus::Running || !self.is_abandoned(&candidate) {
                continue;
            }
            let endpoint = match self.ctx.directory.get_device(&candidate.device_id).await {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(id = %candidate.id, device = %candidate.device_id, error = %e, "skipping stale instance");
                    continue;
                }
            };
            let lease = self
                .ctx
                .locks
                .lock_device(&candidate.device_id, &endpoint.ssh_host)
                .await;
            // Re-read under the lease; it may have been finished or removed.
            match self.ctx.store.get_shared_instance(&candidate.id)? {
                Some(current)
                    if current.status != InstanceStatus::Running && self.is_abandoned(&current) =>
                {
                    self.discard(&current, lease.ssh_host()).await?;
                    reaped.push(current);
                }
                _ => {}
            }
        }
        Ok(reaped)
    }

    fn is_abandoned(&self, instance: &SharedInstance) -> bool {
        instance.status == InstanceStatus::Failed
            || epoch_secs().saturating_sub(instance.created_at)
                >= self.ctx.config.provisioning_stale_after.as_secs()
    }

    /// Best-effort teardown of an abandoned instance, then delete its row.
    async fn discard(&self, instance: &SharedInstance, ssh_host: &str) -> PoolResult<()> {
        if let Ok(engine) = instance.engine.parse::<Engine>() {
            let settings = self
                .ctx
                .catalog
                .settings(engine)
                .cloned()
                .unwrap_or_else(|_| EngineSettings::builtin(engine));
            let spec = engine.render_deployment(instance, &settings, ssh_host, "");
            if let Err(e) = self.ctx.orchestrator.remove_with_cleanup(&spec).await {
                warn!(id = %instance.id, error = %e, "cleanup of abandoned instance failed");
            }
        }
        self.ctx.store.delete_shared_instance(&instance.id)?;
        warn!(
            id = %instance.id,
            engine = %instance.engine,
            device = %instance.device_id,
            status = ?instance.status,
            "abandoned shared instance removed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::Harness;

    #[tokio::test]
    async fn creates_then_reuses_running_instance() {
        let h = Harness::new();
        let registry = SharedInstanceRegistry::new(h.ctx.clone(), ResourceFamily::Cache);

        let (created, is_new) = registry.get_or_create("dev-1", "redis", "", "redis").await.unwrap();
        assert!(is_new);
        assert_eq!(created.status, InstanceStatus::Provisioning);
        assert_eq!(created.version, "7");
        assert_eq!(created.port, 6379);
        assert_eq!(created.container_name, "fleetpool-redis");
        assert_eq!(created.max_memory_mb, Some(256));
        assert!(h.vault.contains("pool/cache/dev-1/redis/master"));

        registry.mark_running(&created).unwrap();
        let (again, is_new) = registry.get_or_create("dev-1", "redis", "", "redis").await.unwrap();
        assert!(!is_new);
        assert_eq!(again.id, created.id);
        assert_eq!(again.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn validates_inputs() {
        let h = Harness::new();
        let db = SharedInstanceRegistry::new(h.ctx.clone(), ResourceFamily::Database);
        for (device, engine, version) in [
            ("", "postgres", "16"),
            ("dev-1", "oracle", "19"),
            ("dev-1", "redis", "7"),
            ("dev-1", "postgres", ""),
        ] {
            let err = db.get_or_create(device, engine, version, "db").await.unwrap_err();
            assert!(matches!(err, PoolError::InvalidParameter(_)), "{device}/{engine}/{version}");
        }
        assert!(h.ctx.store.list_shared_instances().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let h = Harness::new();
        let registry = SharedInstanceRegistry::new(h.ctx.clone(), ResourceFamily::Cache);
        let err = registry.get_or_create("nope", "redis", "", "").await.unwrap_err();
        assert!(matches!(err, PoolError::NotFound(_)));
    }

    #[tokio::test]
    async fn pending_instance_reports_not_yet_running() {
        let h = Harness::new();
        let registry = SharedInstanceRegistry::new(h.ctx.clone(), ResourceFamily::Database);
        registry.get_or_create("dev-1", "postgres", "16", "pg").await.unwrap();

        let err = registry.get_or_create("dev-1", "postgres", "16", "pg").await.unwrap_err();
        assert!(matches!(err, PoolError::NotYetRunning { .. }));
    }

    #[tokio::test]
    async fn stale_provisioning_row_is_reclaimed() {
        let h = Harness::new();
        let registry = SharedInstanceRegistry::new(h.ctx.clone(), ResourceFamily::Database);
        let (mut stuck, _) = registry.get_or_create("dev-1", "postgres", "16", "pg").await.unwrap();
        stuck.created_at = 0;
        h.ctx.store.update_shared_instance(&stuck).unwrap();

        let (fresh, created) = registry.get_or_create("dev-1", "postgres", "16", "pg").await.unwrap();
        assert!(created);
        assert_ne!(fresh.id, stuck.id);
        assert!(h.ctx.store.get_shared_instance(&stuck.id).unwrap().is_none());
        assert_eq!(h.orchestrator.removed(), vec!["fleetpool-pg".to_string()]);
    }

    #[tokio::test]
    async fn reap_stale_only_touches_abandoned_rows() {
        let h = Harness::new();
        let registry = SharedInstanceRegistry::new(h.ctx.clone(), ResourceFamily::Cache);
        let (mut stuck, _) = registry.get_or_create("dev-1", "redis", "", "").await.unwrap();
        stuck.created_at = 0;
        h.ctx.store.update_shared_instance(&stuck).unwrap();
        let (pending, _) = registry.get_or_create("dev-1", "valkey", "", "").await.unwrap();

        let reaped = registry.reap_stale().await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, stuck.id);
        assert!(h.ctx.store.get_shared_instance(&pending.id).unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_get_distinct_ports() {
        let h = Harness::new();
        let db = Arc::new(SharedInstanceRegistry::new(h.ctx.clone(), ResourceFamily::Database));
        let cache = Arc::new(SharedInstanceRegistry::new(h.ctx.clone(), ResourceFamily::Cache));

        let mut tasks = tokio::task::JoinSet::new();
        for engine in Engine::ALL {
            let registry = match engine.family() {
                ResourceFamily::Database => db.clone(),
                ResourceFamily::Cache => cache.clone(),
            };
            tasks.spawn(async move {
                registry
                    .get_or_create("dev-1", engine.as_str(), "1", engine.as_str())
                    .await
                    .map(|(i, _)| i.port)
            });
        }

        let mut ports = Vec::new();
        while let Some(res) = tasks.join_next().await {
            ports.push(res.unwrap().unwrap());
        }
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), Engine::ALL.len());
        assert!(ports.iter().all(|p| *p >= 1024));
    }
}
