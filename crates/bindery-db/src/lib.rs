//! Trust store for bindery.
//!
//! Holds the persisted set of groups and trusted devices behind the
//! [`TrustStore`] trait, with two implementations:
//!
//! - [`SqliteTrustStore`]: SQLite through an `r2d2` pool, WAL mode, and
//!   embedded migrations. Each mutation is its own statement or transaction,
//!   so [`TrustStore::save`] only records a checkpoint.
//! - [`MemoryTrustStore`]: a lock-protected map with the same semantics, for
//!   tests and embedders that persist elsewhere.
//!
//! Records are scoped by OS account. Deleting a group cascades to its member
//! devices in both implementations.

mod memory;
mod migrations;
mod pool;
mod sqlite;
mod store;

pub use memory::MemoryTrustStore;
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, open_migrated_pool, DbPool, DbRuntimeSettings, PoolError, MEMORY_PATH};
pub use sqlite::SqliteTrustStore;
pub use store::{DeviceEntry, DeviceQuery, GroupEntry, GroupQuery, StoreError, TrustStore};
