//! Numbered-database slot allocation within a shared cache instance.

use tracing::debug;

use crate::context::PoolContext;
use crate::error::{PoolError, PoolResult};
use crate::locks::InstanceLease;

/// Finds unused slot numbers in `0..max_slots`.
pub struct SlotAllocator {
    ctx: PoolContext,
}

impl SlotAllocator {
    pub fn new(ctx: PoolContext) -> Self {
        Self { ctx }
    }

    /// First unclaimed slot of the leased instance.
    ///
    /// The caller must hold the lease until the resource row claiming the
    /// slot is committed.
    pub fn find_available_slot(&self, lease: &InstanceLease, max_slots: u32) -> PoolResult<u32> {
        let instance = lease.instance_id();
        if max_slots == 0 {
            let engine = self
                .ctx
                .store
                .get_shared_instance(instance)?
                .map(|i| i.engine)
                .unwrap_or_else(|| instance.to_string());
            return Err(PoolError::UnsupportedByEngine(engine));
        }

        let claimed = self.ctx.store.claimed_slots(instance)?;
        let slot = (0..max_slots)
            .find(|s| !claimed.contains(s))
            .ok_or_else(|| PoolError::SlotsExhausted {
                instance: instance.to_string(),
                max_slots,
            })?;
        debug!(%instance, slot, "slot allocated");
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Harness;
    use fleetpool_state::{ProvisionedResource, ResourceStatus};

    fn claim(h: &Harness, app: &str, slot: u32) {
        h.ctx
            .store
            .insert_provisioned_resource(
                &ProvisionedResource {
                    id: format!("r-{app}"),
                    shared_instance_id: "i-1".to_string(),
                    app_slug: app.to_string(),
                    device_id: "dev-1".to_string(),
                    resource_name: app.to_string(),
                    key_prefix: Some(format!("{app}:")),
                    username: Some(app.to_string()),
                    slot_number: Some(slot),
                    credential_ref: "ref".to_string(),
                    max_memory_mb: None,
                    status: ResourceStatus::Ready,
                    error: None,
                    created_at: 0,
                    provisioned_at: None,
                },
                true,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn fills_gaps_first() {
        let h = Harness::new();
        claim(&h, "a", 0);
        claim(&h, "b", 2);
        let lease = h.ctx.locks.lock_instance("i-1").await;
        let slot = SlotAllocator::new(h.ctx.clone())
            .find_available_slot(&lease, 16)
            .unwrap();
        assert_eq!(slot, 1);
    }

    #[tokio::test]
    async fn zero_slots_is_unsupported() {
        let h = Harness::new();
        let lease = h.ctx.locks.lock_instance("i-1").await;
        let err = SlotAllocator::new(h.ctx.clone())
            .find_available_slot(&lease, 0)
            .unwrap_err();
        assert!(matches!(err, PoolError::UnsupportedByEngine(_)));
    }

    #[tokio::test]
    async fn exhausted_when_all_taken() {
        let h = Harness::new();
        claim(&h, "a", 0);
        claim(&h, "b", 1);
        let lease = h.ctx.locks.lock_instance("i-1").await;
        let err = SlotAllocator::new(h.ctx.clone())
            .find_available_slot(&lease, 2)
            .unwrap_err();
        assert!(matches!(err, PoolError::SlotsExhausted { max_slots: 2, .. }));
    }
}
