//! redb table definitions for the fleetpool state store.
//!
//! Each table uses `&str` keys and `&[u8]` values. Record tables hold
//! JSON-serialized domain types; index tables hold the owning record's id
//! (or app slug) as raw UTF-8.

use redb::TableDefinition;

/// Shared instances keyed by `{instance_id}`.
pub const SHARED_INSTANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("shared_instances");

/// Unique index `{device_id}/{engine}` → instance id.
pub const INSTANCE_BY_ENGINE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("instance_by_engine");

/// Unique index `{device_id}:{port:05}` → instance id.
pub const PORT_CLAIMS: TableDefinition<&str, &[u8]> = TableDefinition::new("port_claims");

/// Provisioned resources keyed by `{instance_id}/{app_slug}`.
pub const PROVISIONED_RESOURCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("provisioned_resources");

/// Unique index `{instance_id}:{slot:05}` → app slug.
pub const SLOT_CLAIMS: TableDefinition<&str, &[u8]> = TableDefinition::new("slot_claims");

/// Devices keyed by `{device_id}`.
pub const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");

/// Opaque secrets keyed by vault key.
pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
