//! StateStore: redb-backed persistence for shared resource pools.
//!
//! Provides typed operations over shared instances, provisioned resources,
//! devices, and secrets. All record values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! redb serializes write transactions, so every multi-table update here
//! (insert plus index claims, cascade deletes, counter bumps) is atomic.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SHARED_INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(INSTANCE_BY_ENGINE).map_err(map_err!(Table))?;
        txn.open_table(PORT_CLAIMS).map_err(map_err!(Table))?;
        txn.open_table(PROVISIONED_RESOURCES).map_err(map_err!(Table))?;
        txn.open_table(SLOT_CLAIMS).map_err(map_err!(Table))?;
        txn.open_table(DEVICES).map_err(map_err!(Table))?;
        txn.open_table(SECRETS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Shared instances ───────────────────────────────────────────

    /// Insert a new shared instance, claiming its `(device, engine)` and
    /// `(device, port)` slots.
    ///
    /// Fails with [`StateError::Conflict`] if the id, the engine slot, or
    /// the port is already taken on that device.
    pub fn insert_shared_instance(&self, instance: &SharedInstance) -> StateResult<()> {
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        let engine_key = instance.engine_key();
        let port_key = instance.port_key();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut rows = txn.open_table(SHARED_INSTANCES).map_err(map_err!(Table))?;
            let mut by_engine = txn.open_table(INSTANCE_BY_ENGINE).map_err(map_err!(Table))?;
            let mut ports = txn.open_table(PORT_CLAIMS).map_err(map_err!(Table))?;

            if rows.get(instance.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("instance {} exists", instance.id)));
            }
            if by_engine.get(engine_key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!(
                    "{engine_key} already has a shared instance"
                )));
            }
            if ports.get(port_key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!(
                    "port {} already claimed on {}",
                    instance.port, instance.device_id
                )));
            }

            rows.insert(instance.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            by_engine
                .insert(engine_key.as_str(), instance.id.as_bytes())
                .map_err(map_err!(Write))?;
            ports
                .insert(port_key.as_str(), instance.id.as_bytes())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %instance.id, %engine_key, port = instance.port, "shared instance inserted");
        Ok(())
    }

    /// Overwrite an existing shared instance (status, counters, timestamps).
    ///
    /// The device, engine, and port are identity and must not change; the
    /// index tables are left untouched.
    pub fn update_shared_instance(&self, instance: &SharedInstance) -> StateResult<()> {
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut rows = txn.open_table(SHARED_INSTANCES).map_err(map_err!(Table))?;
            if rows.get(instance.id.as_str()).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("instance {}", instance.id)));
            }
            rows.insert(instance.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a shared instance by id.
    pub fn get_shared_instance(&self, id: &str) -> StateResult<Option<SharedInstance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SHARED_INSTANCES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Find the shared instance for a `(device, engine)` pair, in any status.
    pub fn find_shared_instance(
        &self,
        device_id: &str,
        engine: &str,
    ) -> StateResult<Option<SharedInstance>> {
        let key = engine_key(device_id, engine);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(INSTANCE_BY_ENGINE).map_err(map_err!(Table))?;
        let id = match index.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => String::from_utf8_lossy(guard.value()).into_owned(),
            None => return Ok(None),
        };
        let rows = txn.open_table(SHARED_INSTANCES).map_err(map_err!(Table))?;
        match rows.get(id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all shared instances.
    pub fn list_shared_instances(&self) -> StateResult<Vec<SharedInstance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SHARED_INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// List the shared instances hosted on one device.
    pub fn list_shared_instances_for_device(
        &self,
        device_id: &str,
    ) -> StateResult<Vec<SharedInstance>> {
        Ok(self
            .list_shared_instances()?
            .into_iter()
            .filter(|i| i.device_id == device_id)
            .collect())
    }

    /// Ports claimed by any shared instance on the device.
    pub fn claimed_ports(&self, device_id: &str) -> StateResult<BTreeSet<u16>> {
        let prefix = format!("{device_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PORT_CLAIMS).map_err(map_err!(Table))?;
        let mut ports = BTreeSet::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(port) = key
                .value()
                .strip_prefix(&prefix)
                .and_then(|p| p.parse::<u16>().ok())
            {
                ports.insert(port);
            }
        }
        Ok(ports)
    }

    /// Delete a shared instance together with its index claims and every
    /// resource provisioned inside it. Returns true if it existed.
    pub fn delete_shared_instance(&self, id: &str) -> StateResult<bool> {
        let resource_prefix = format!("{id}/");
        let slot_prefix = format!("{id}:");

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut rows = txn.open_table(SHARED_INSTANCES).map_err(map_err!(Table))?;
            let removed = rows
                .remove(id)
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec());
            existed = removed.is_some();

            if let Some(bytes) = removed {
                let instance: SharedInstance = decode(&bytes)?;
                let mut by_engine =
                    txn.open_table(INSTANCE_BY_ENGINE).map_err(map_err!(Table))?;
                by_engine
                    .remove(instance.engine_key().as_str())
                    .map_err(map_err!(Write))?;
                let mut ports = txn.open_table(PORT_CLAIMS).map_err(map_err!(Table))?;
                ports
                    .remove(instance.port_key().as_str())
                    .map_err(map_err!(Write))?;
            }

            let mut resources =
                txn.open_table(PROVISIONED_RESOURCES).map_err(map_err!(Table))?;
            let keys = prefixed_keys(&resources, &resource_prefix)?;
            for key in &keys {
                resources.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            let mut slots = txn.open_table(SLOT_CLAIMS).map_err(map_err!(Table))?;
            let keys = prefixed_keys(&slots, &slot_prefix)?;
            for key in &keys {
                slots.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, existed, "shared instance deleted");
        Ok(existed)
    }

    /// Atomically bump an instance's resource count. Returns the new count.
    pub fn increment_resource_count(&self, id: &str) -> StateResult<u32> {
        self.adjust_resource_count(id, |n| n.saturating_add(1))
    }

    /// Atomically lower an instance's resource count (floored at zero).
    pub fn decrement_resource_count(&self, id: &str) -> StateResult<u32> {
        self.adjust_resource_count(id, |n| n.saturating_sub(1))
    }

    fn adjust_resource_count(&self, id: &str, f: impl FnOnce(u32) -> u32) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut rows = txn.open_table(SHARED_INSTANCES).map_err(map_err!(Table))?;
            let bytes = rows
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(format!("instance {id}")))?;
            let mut instance: SharedInstance = decode(&bytes)?;
            instance.resource_count = f(instance.resource_count);
            count = instance.resource_count;
            let value = serde_json::to_vec(&instance).map_err(map_err!(Serialize))?;
            rows.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Provisioned resources ──────────────────────────────────────

    /// Insert a new provisioned resource, claiming its slot when it has one
    /// that must be unique (`claim_slot`).
    ///
    /// Fails with [`StateError::Conflict`] if the app already has a resource
    /// in this instance, or the slot is taken.
    pub fn insert_provisioned_resource(
        &self,
        resource: &ProvisionedResource,
        claim_slot: bool,
    ) -> StateResult<()> {
        let key = resource.table_key();
        let value = serde_json::to_vec(resource).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut rows = txn.open_table(PROVISIONED_RESOURCES).map_err(map_err!(Table))?;
            if rows.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("resource {key} exists")));
            }
            if let (true, Some(slot)) = (claim_slot, resource.slot_number) {
                let mut slots = txn.open_table(SLOT_CLAIMS).map_err(map_err!(Table))?;
                let slot_key = slot_key(&resource.shared_instance_id, slot);
                if slots.get(slot_key.as_str()).map_err(map_err!(Read))?.is_some() {
                    return Err(StateError::Conflict(format!(
                        "slot {slot} already claimed in {}",
                        resource.shared_instance_id
                    )));
                }
                slots
                    .insert(slot_key.as_str(), resource.app_slug.as_bytes())
                    .map_err(map_err!(Write))?;
            }
            rows.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, slot = ?resource.slot_number, "provisioned resource inserted");
        Ok(())
    }

    /// Overwrite an existing provisioned resource (status, timestamps).
    pub fn update_provisioned_resource(&self, resource: &ProvisionedResource) -> StateResult<()> {
        let key = resource.table_key();
        let value = serde_json::to_vec(resource).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut rows = txn.open_table(PROVISIONED_RESOURCES).map_err(map_err!(Table))?;
            if rows.get(key.as_str()).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("resource {key}")));
            }
            rows.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the resource an app holds within an instance.
    pub fn get_provisioned_resource(
        &self,
        instance_id: &str,
        app_slug: &str,
    ) -> StateResult<Option<ProvisionedResource>> {
        let key = resource_key(instance_id, app_slug);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROVISIONED_RESOURCES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all resources provisioned inside an instance.
    pub fn list_resources_for_instance(
        &self,
        instance_id: &str,
    ) -> StateResult<Vec<ProvisionedResource>> {
        let prefix = format!("{instance_id}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROVISIONED_RESOURCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    /// Slot numbers already claimed within an instance.
    pub fn claimed_slots(&self, instance_id: &str) -> StateResult<BTreeSet<u32>> {
        let prefix = format!("{instance_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SLOT_CLAIMS).map_err(map_err!(Table))?;
        let mut slots = BTreeSet::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(slot) = key
                .value()
                .strip_prefix(&prefix)
                .and_then(|s| s.parse::<u32>().ok())
            {
                slots.insert(slot);
            }
        }
        Ok(slots)
    }

    /// Delete an app's resource and release its slot. Returns true if it existed.
    pub fn delete_provisioned_resource(
        &self,
        instance_id: &str,
        app_slug: &str,
    ) -> StateResult<bool> {
        let key = resource_key(instance_id, app_slug);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut rows = txn.open_table(PROVISIONED_RESOURCES).map_err(map_err!(Table))?;
            let removed = rows
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec());
            existed = removed.is_some();

            if let Some(bytes) = removed {
                let resource: ProvisionedResource = decode(&bytes)?;
                if let Some(slot) = resource.slot_number {
                    let mut slots = txn.open_table(SLOT_CLAIMS).map_err(map_err!(Table))?;
                    let slot_key = slot_key(instance_id, slot);
                    // Only release the claim if this app owns it; slotless
                    // engines share slot 0 without claiming it.
                    let owned = slots
                        .get(slot_key.as_str())
                        .map_err(map_err!(Read))?
                        .is_some_and(|guard| guard.value() == app_slug.as_bytes());
                    if owned {
                        slots.remove(slot_key.as_str()).map_err(map_err!(Write))?;
                    }
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "provisioned resource deleted");
        Ok(existed)
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or update a device.
    pub fn put_device(&self, device: &Device) -> StateResult<()> {
        let value = serde_json::to_vec(device).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            table
                .insert(device.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a device by ID.
    pub fn get_device(&self, device_id: &str) -> StateResult<Option<Device>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        match table.get(device_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all devices.
    pub fn list_devices(&self) -> StateResult<Vec<Device>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Delete a device by ID. Returns true if it existed.
    pub fn delete_device(&self, device_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            existed = table.remove(device_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Secrets ────────────────────────────────────────────────────

    /// Store an opaque secret under a key, replacing any previous value.
    pub fn put_secret(&self, key: &str, secret: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
            table
                .insert(key, secret.as_bytes())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a secret by key.
    pub fn get_secret(&self, key: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => String::from_utf8(guard.value().to_vec())
                .map(Some)
                .map_err(map_err!(Deserialize)),
            None => Ok(None),
        }
    }

    /// Delete a secret. Returns true if it existed.
    pub fn delete_secret(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

/// Collect the keys of a table that start with `prefix`.
fn prefixed_keys<T>(table: &T, prefix: &str) -> StateResult<Vec<String>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            keys.push(key.value().to_string());
        }
    }
    Ok(keys)
}
