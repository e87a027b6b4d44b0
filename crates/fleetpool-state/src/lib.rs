//! fleetpool-state: embedded registry for shared resource pools.
//!
//! Backed by [redb](https://docs.rs/redb), persists shared database/cache
//! instances, the per-app resources provisioned inside them, the device
//! directory, and opaque secrets.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Uniqueness constraints (one instance per `(device, engine)`, one port per
//! device, one resource per `(instance, app)`, one slot per instance) are
//! kept as index tables and checked inside the same write transaction that
//! inserts the row, so a violating insert fails with
//! [`StateError::Conflict`] and leaves nothing behind.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
