//! Domain types for the fleetpool state store.
//!
//! These types represent the persisted state of shared instances, the
//! per-app resources provisioned inside them, and the devices they run on.
//! All types are serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a shared instance.
pub type InstanceId = String;

/// Unique identifier for a provisioned resource.
pub type ResourceId = String;

/// Unique identifier for a device in the fleet.
pub type DeviceId = String;

// ── Families ──────────────────────────────────────────────────────

/// The kind of service a shared instance provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFamily {
    Database,
    Cache,
}

impl ResourceFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceFamily::Database => "database",
            ResourceFamily::Cache => "cache",
        }
    }
}

impl fmt::Display for ResourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Shared instance ───────────────────────────────────────────────

/// A running shared database or cache service on one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedInstance {
    pub id: InstanceId,
    pub device_id: DeviceId,
    pub family: ResourceFamily,
    /// Engine name ("postgres", "redis", ...).
    pub engine: String,
    pub version: String,
    pub container_name: String,
    /// Host port the service is published on.
    pub port: u16,
    /// Superuser name (database family only).
    pub master_username: Option<String>,
    /// Vault key of the master password.
    pub master_credential_ref: String,
    /// Memory ceiling in MiB (cache family only).
    pub max_memory_mb: Option<u32>,
    pub status: InstanceStatus,
    /// Failure detail when `status` is `Failed`.
    pub error: Option<String>,
    /// Number of apps with a `ready` resource inside this instance.
    pub resource_count: u32,
    /// Unix timestamp (seconds) when the row was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) when the instance became `running`.
    pub deployed_at: Option<u64>,
}

/// Lifecycle status of a shared instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Failed,
}

impl SharedInstance {
    /// Key into the `(device, engine)` unique index.
    pub fn engine_key(&self) -> String {
        engine_key(&self.device_id, &self.engine)
    }

    /// Key into the `(device, port)` unique index.
    pub fn port_key(&self) -> String {
        port_key(&self.device_id, self.port)
    }
}

/// Build the `(device, engine)` index key.
pub fn engine_key(device_id: &str, engine: &str) -> String {
    format!("{device_id}/{engine}")
}

/// Build the `(device, port)` index key. Ports are zero-padded so a
/// device's claims sort numerically.
pub fn port_key(device_id: &str, port: u16) -> String {
    format!("{device_id}:{port:05}")
}

// ── Provisioned resource ──────────────────────────────────────────

/// One application's access grant within a shared instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionedResource {
    pub id: ResourceId,
    pub shared_instance_id: InstanceId,
    pub app_slug: String,
    pub device_id: DeviceId,
    /// Database name, or the sanitized app name used for cache ACLs.
    pub resource_name: String,
    /// Key namespace (cache family only), e.g. `"myapp:"`.
    pub key_prefix: Option<String>,
    pub username: Option<String>,
    /// Numbered database (cache family only). `0` for engines without
    /// numbered databases.
    pub slot_number: Option<u32>,
    /// Vault key of the app password.
    pub credential_ref: String,
    pub max_memory_mb: Option<u32>,
    pub status: ResourceStatus,
    pub error: Option<String>,
    pub created_at: u64,
    pub provisioned_at: Option<u64>,
}

/// Lifecycle status of a provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Provisioning,
    Ready,
    Failed,
}

impl ProvisionedResource {
    /// Build the composite key for the provisioned resources table.
    pub fn table_key(&self) -> String {
        resource_key(&self.shared_instance_id, &self.app_slug)
    }
}

/// Build the `(instance, app)` key.
pub fn resource_key(instance_id: &str, app_slug: &str) -> String {
    format!("{instance_id}/{app_slug}")
}

/// Build the `(instance, slot)` index key.
pub fn slot_key(instance_id: &str, slot: u32) -> String {
    format!("{instance_id}:{slot:05}")
}

// ── Device ────────────────────────────────────────────────────────

/// A device in the homelab fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Address applications use to reach services on this device.
    pub address: String,
    /// Host string passed to the SSH transport (`user@host` or an alias).
    pub ssh_host: String,
    /// Unix timestamp of the last directory update.
    pub updated_at: u64,
}
