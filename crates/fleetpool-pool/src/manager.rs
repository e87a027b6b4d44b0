//! The resource pool façade, one per resource family.
//!
//! `ensure_resource_for_app` is the entry point the rest of the system
//! calls: it reuses or creates the shared instance, deploys it when it is
//! new (rolling back on any deployment failure), and provisions the app
//! inside it. Every error it returns is tagged with the [`Stage`] it came
//! from.

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use fleetpool_state::{InstanceStatus, ProvisionedResource, ResourceFamily, ResourceStatus, SharedInstance};

use crate::context::PoolContext;
use crate::engine::{Engine, resource_name_for};
use crate::error::{PoolError, PoolResult, Stage};
use crate::provisioner::{ConnectionInfo, ResourceProvisioner};
use crate::registry::SharedInstanceRegistry;
use crate::stats::PoolStats;

/// Hands out per-app databases or caches on shared instances.
pub struct ResourcePoolManager {
    ctx: PoolContext,
    family: ResourceFamily,
    registry: SharedInstanceRegistry,
    provisioner: ResourceProvisioner,
}

impl ResourcePoolManager {
    pub fn new(ctx: PoolContext, family: ResourceFamily) -> Self {
        Self {
            registry: SharedInstanceRegistry::new(ctx.clone(), family),
            provisioner: ResourceProvisioner::new(ctx.clone()),
            ctx,
            family,
        }
    }

    /// Manager for the database family (postgres, mysql, mariadb).
    pub fn database(ctx: PoolContext) -> Self {
        Self::new(ctx, ResourceFamily::Database)
    }

    /// Manager for the cache family (redis, valkey, memcached).
    pub fn cache(ctx: PoolContext) -> Self {
        Self::new(ctx, ResourceFamily::Cache)
    }

    pub fn family(&self) -> ResourceFamily {
        self.family
    }

    /// Give `app_slug` a ready resource on the shared `engine` instance of
    /// `device_id`, creating and deploying the instance first if needed.
    pub async fn ensure_resource_for_app(
        &self,
        device_id: &str,
        engine: &str,
        app_slug: &str,
    ) -> PoolResult<ProvisionedResource> {
        let app_slug = app_slug.trim();
        let engine = self
            .ctx
            .catalog
            .resolve(engine, self.family)
            .map_err(|e| e.at(Stage::InstanceCreation))?;
        if resource_name_for(app_slug).is_empty() {
            return Err(PoolError::InvalidParameter("app slug is required".into()).at(Stage::InstanceCreation));
        }

        let (instance, created) = self
            .acquire_instance(device_id, engine)
            .await
            .map_err(|e| e.at(Stage::InstanceCreation))?;
        let instance = if created {
            self.deploy(instance, engine).await?
        } else {
            instance
        };

        let resource = self
            .provisioner
            .provision_for_app(&instance, app_slug, device_id)
            .await
            .map_err(|e| e.at(Stage::Provisioning))?;
        match resource.status {
            ResourceStatus::Ready => Ok(resource),
            ResourceStatus::Failed => Err(PoolError::RemoteCommandFailed(
                resource
                    .error
                    .unwrap_or_else(|| format!("{app_slug} previously failed to provision")),
            )
            .at(Stage::Provisioning)),
            ResourceStatus::Provisioning => Err(PoolError::ResourceBusy {
                app: app_slug.to_string(),
                engine: engine.to_string(),
            }
            .at(Stage::Provisioning)),
        }
    }

    /// Get-or-create, waiting out a concurrent creator for up to
    /// `contention_wait`.
    async fn acquire_instance(&self, device_id: &str, engine: Engine) -> PoolResult<(SharedInstance, bool)> {
        let version = self.ctx.catalog.settings(engine)?.default_version.clone();
        let deadline = Instant::now() + self.ctx.config.contention_wait;
        loop {
            match self
                .registry
                .get_or_create(device_id, engine.as_str(), &version, engine.as_str())
                .await
            {
                Err(PoolError::NotYetRunning { .. }) if Instant::now() < deadline => {
                    debug!(%device_id, %engine, "waiting for concurrent deployment");
                    sleep(self.ctx.config.contention_poll).await;
                }
                other => return other,
            }
        }
    }

    /// Deploy a freshly created instance and mark it running. Any failure
    /// rolls the instance back.
    async fn deploy(&self, instance: SharedInstance, engine: Engine) -> PoolResult<SharedInstance> {
        let prepared = async {
            let settings = self.ctx.catalog.settings(engine)?;
            let endpoint = self.ctx.directory.get_device(&instance.device_id).await?;
            let master_password = self.ctx.vault.get(&instance.master_credential_ref).await?;
            Ok::<_, PoolError>(engine.render_deployment(
                &instance,
                settings,
                &endpoint.ssh_host,
                &master_password,
            ))
        }
        .await;
        let spec = match prepared {
            Ok(spec) => spec,
            Err(e) => {
                let e = e.at(Stage::Deployment);
                self.registry.roll_back(&instance, None, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.ctx.orchestrator.deploy(&spec).await {
            let e = PoolError::DeploymentFailed(e.to_string()).at(Stage::Deployment);
            self.registry.roll_back(&instance, Some(&spec), &e).await;
            return Err(e);
        }
        if let Err(e) = self
            .ctx
            .orchestrator
            .wait_for_healthy(&spec.name, &spec.host, self.ctx.config.health_timeout)
            .await
        {
            let e = PoolError::from(e).at(Stage::HealthCheck);
            self.registry.roll_back(&instance, Some(&spec), &e).await;
            return Err(e);
        }

        match self.registry.mark_running(&instance) {
            Ok(running) => {
                info!(
                    id = %running.id,
                    %engine,
                    device = %running.device_id,
                    port = running.port,
                    "shared instance deployed"
                );
                Ok(running)
            }
            Err(e) => {
                let e = e.at(Stage::Deployment);
                self.registry.roll_back(&instance, Some(&spec), &e).await;
                Err(e)
            }
        }
    }

    /// The running instance for `(device_id, engine)`, or `NotFound`.
    fn running_instance(&self, device_id: &str, engine: &str) -> PoolResult<SharedInstance> {
        let engine = self.ctx.catalog.resolve(engine, self.family)?;
        match self.registry.find(device_id, engine)? {
            Some(instance) if instance.status == InstanceStatus::Running => Ok(instance),
            Some(instance) => Err(PoolError::NotYetRunning {
                device: instance.device_id,
                engine: instance.engine,
            }),
            None => Err(PoolError::NotFound(format!("no shared {engine} on {device_id}"))),
        }
    }

    /// Connection details for an app's resource.
    pub async fn get_credentials(
        &self,
        device_id: &str,
        engine: &str,
        app_slug: &str,
    ) -> PoolResult<ConnectionInfo> {
        let instance = self.running_instance(device_id, engine)?;
        self.provisioner.get_credentials(&instance, app_slug.trim()).await
    }

    /// Drop an app's resource from the shared instance.
    pub async fn release_resource_for_app(
        &self,
        device_id: &str,
        engine: &str,
        app_slug: &str,
    ) -> PoolResult<()> {
        let app_slug = app_slug.trim();
        let instance = self
            .running_instance(device_id, engine)
            .map_err(|e| e.at(Stage::Release))?;
        let released = self
            .provisioner
            .release_for_app(&instance, app_slug)
            .await
            .map_err(|e| e.at(Stage::Release))?;
        if !released {
            return Err(PoolError::NotFound(format!(
                "{app_slug} has no {engine} resource on {device_id}"
            ))
            .at(Stage::Release));
        }
        Ok(())
    }

    /// Every shared instance of this family.
    pub fn list_instances(&self) -> PoolResult<Vec<SharedInstance>> {
        self.registry.list()
    }

    /// Usage summary for this family.
    pub fn stats(&self) -> PoolResult<PoolStats> {
        PoolStats::collect(&self.ctx, self.family, &self.registry.list()?)
    }

    /// Remove instances left behind by interrupted deployments.
    pub async fn reconcile_stale(&self) -> PoolResult<Vec<SharedInstance>> {
        let reaped = self.registry.reap_stale().await?;
        if !reaped.is_empty() {
            info!(family = %self.family, count = reaped.len(), "stale shared instances reconciled");
        }
        Ok(reaped)
    }
}
