//! Sharded PostgreSQL storage engine for FHIRShard.
//!
//! This crate routes batches of resource and index rows across a set of
//! physical shards and merges each shard's slice atomically.
//!
//! # Example
//!
//! ```ignore
//! use fhirshard_core::TransactionId;
//! use fhirshard_sharding::{ShardingConfig, ShardletMap, SqlService};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(batch: fhirshard_core::ResourceBatch) -> fhirshard_sharding::Result<()> {
//! let config = ShardingConfig::new("postgres://localhost/fhirshard_central");
//! let map = ShardletMap::load(&config).await?;
//! let service = SqlService::new(map, config);
//!
//! let token = CancellationToken::new();
//! let tx = service.begin_transaction(None, Some("import"), 3600).await?;
//! let affected = service.merge_resources(tx, batch, &token).await?;
//! service.commit_transaction(None, tx, None, false).await?;
//! # let _ = affected;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`config`]: configuration for the central store and per-shard pools
//! - [`error`]: error taxonomy and transient-error classification
//! - [`topology`]: the versioned, immutable shardlet-to-shard map
//! - [`service`]: shard-aware execution (retries, fan-out, transactions)
//! - [`merge`]: partitioning and the per-shard atomic multi-table merge
//! - [`schema`]: embedded DDL for the central and per-shard tables

mod config;
mod error;
mod merge;
mod service;
mod topology;

/// Embedded schema DDL and bootstrap helpers.
pub mod schema;

pub use config::ShardingConfig;
pub use error::{ShardError, is_transient, is_transient_code};
pub use merge::{MergePlan, ShardMergeAction};
pub use service::SqlService;
pub use topology::{Shard, ShardletMap, ShardletMapRow};

/// Result type alias for sharding operations.
pub type Result<T> = std::result::Result<T, ShardError>;
