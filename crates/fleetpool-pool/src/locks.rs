//! Keyed async locks that serialize allocation per device and per instance.
//!
//! Port allocation holds a [`DeviceLease`] from the moment the claimed-port
//! set is read until the new instance row (the claim) is committed; slot
//! allocation does the same with an [`InstanceLease`]. Callers on different
//! devices or instances never contend.
//!
//! The locks are in-process: one daemon owns the state store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type Scope = Arc<AsyncMutex<()>>;

/// Registry of per-scope locks.
#[derive(Clone, Default)]
pub struct ScopeLocks {
    scopes: Arc<Mutex<HashMap<String, Scope>>>,
}

/// Exclusive hold on a device's port space.
///
/// Carries the device's resolved SSH host so the holder can run live checks
/// without going back to any directory or store.
pub struct DeviceLease {
    device_id: String,
    ssh_host: String,
    _guard: OwnedMutexGuard<()>,
}

/// Exclusive hold on a shared instance's slot space.
pub struct InstanceLease {
    instance_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a device's port space.
    pub async fn lock_device(&self, device_id: &str, ssh_host: &str) -> DeviceLease {
        let guard = self.scope(&format!("device/{device_id}")).lock_owned().await;
        trace!(%device_id, "device lease acquired");
        DeviceLease {
            device_id: device_id.to_string(),
            ssh_host: ssh_host.to_string(),
            _guard: guard,
        }
    }

    /// Wait for exclusive access to an instance's slot space.
    pub async fn lock_instance(&self, instance_id: &str) -> InstanceLease {
        let guard = self
            .scope(&format!("instance/{instance_id}"))
            .lock_owned()
            .await;
        trace!(%instance_id, "instance lease acquired");
        InstanceLease {
            instance_id: instance_id.to_string(),
            _guard: guard,
        }
    }

    /// Number of scopes currently tracked.
    pub fn tracked_scopes(&self) -> usize {
        self.scopes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn scope(&self, key: &str) -> Scope {
        let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        // Drop scopes nobody holds or waits on; a waiter keeps its own clone.
        scopes.retain(|_, scope| Arc::strong_count(scope) > 1);
        scopes.entry(key.to_string()).or_default().clone()
    }
}

impl DeviceLease {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn ssh_host(&self) -> &str {
        &self.ssh_host
    }
}

impl InstanceLease {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}
