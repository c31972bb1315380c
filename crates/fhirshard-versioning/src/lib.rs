//! Collection versioning, distributed locking, and rolling data migrations
//! for FHIRShard.
//!
//! Two coordination primitives live here:
//!
//! - [`UpgradeManager`](collection::UpgradeManager) takes a named distributed
//!   lock and runs an ordered list of idempotent collection updaters (index
//!   DDL, version bumps) exactly once per deployment.
//! - [`MigrationTask`](migration::MigrationTask) is a recurring background
//!   loop that partitions document migration work by partition-range, uses a
//!   try-acquire lock per range so multiple service replicas share the work,
//!   and applies pending migrations under optimistic concurrency.
//!
//! Everything else relies on database-level optimistic concurrency rather
//! than application locks.

mod collection;
mod error;
mod lock;
mod migration;

/// Embedded schema DDL for the version store.
pub mod schema;

pub use collection::{
    CollectionUpdater, CollectionVersion, IndexUpdater, SettingsUpdater, UpgradeManager,
    ensure_version_supported, fetch_collection_version, read_collection_version,
};
pub use error::{Result, VersioningError};
pub use lock::{DistributedLock, LockGuard, data_migration_lock_name, upgrade_lock_name};
pub use migration::{
    DAYS_TO_CONTINUE_MONITORING, DocumentMigration, MigrationRecord, MigrationTask,
    MigrationTaskConfig, migration_record_id,
};
