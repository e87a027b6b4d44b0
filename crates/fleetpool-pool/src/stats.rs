//! Usage reporting across shared instances.

use serde::Serialize;

use fleetpool_state::{InstanceStatus, ResourceFamily, SharedInstance};

use crate::context::PoolContext;
use crate::engine::Engine;
use crate::error::PoolResult;

/// Usage of one shared instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceUsage {
    pub id: String,
    pub engine: String,
    pub device: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub resource_count: u32,
    pub slots_used: u32,
    /// `None` for engines without numbered databases.
    pub max_slots: Option<u32>,
}

/// Aggregate usage of one resource family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub family: ResourceFamily,
    pub instances_total: usize,
    pub running: usize,
    pub provisioning: usize,
    pub resources_total: u64,
    pub per_instance: Vec<InstanceUsage>,
}

impl PoolStats {
    /// Collect usage for the given instances of `family`.
    pub fn collect(
        ctx: &PoolContext,
        family: ResourceFamily,
        instances: &[SharedInstance],
    ) -> PoolResult<Self> {
        let mut per_instance = Vec::with_capacity(instances.len());
        for instance in instances.iter().filter(|i| i.family == family) {
            let max_slots = instance
                .engine
                .parse::<Engine>()
                .ok()
                .filter(Engine::supports_numbered_databases)
                .and_then(|e| ctx.catalog.settings(e).ok())
                .map(|s| s.max_slots);
            let slots_used = match max_slots {
                Some(_) => ctx.store.claimed_slots(&instance.id)?.len() as u32,
                None => 0,
            };
            per_instance.push(InstanceUsage {
                id: instance.id.clone(),
                engine: instance.engine.clone(),
                device: instance.device_id.clone(),
                port: instance.port,
                status: instance.status,
                resource_count: instance.resource_count,
                slots_used,
                max_slots,
            });
        }
        per_instance.sort_by(|a, b| (&a.device, &a.engine).cmp(&(&b.device, &b.engine)));

        let count = |status: InstanceStatus| per_instance.iter().filter(|u| u.status == status).count();
        Ok(Self {
            family,
            instances_total: per_instance.len(),
            running: count(InstanceStatus::Running),
            provisioning: count(InstanceStatus::Provisioning),
            resources_total: per_instance.iter().map(|u| u64::from(u.resource_count)).sum(),
            per_instance,
        })
    }
}
