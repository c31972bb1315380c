//! Core identifier scheme and sharded row model for the FHIRShard storage engine.
//!
//! This crate carries no database dependency. It defines:
//!
//! - [`ids`]: the fixed-width composite identifiers used for deterministic
//!   shard routing (`ShardId`, `ShardletId`, `SmartId`) and the monotonic
//!   write-transaction identifiers (`TransactionId`, `ChangeSetId`).
//! - [`rows`]: the routed row kinds consumed by the merge engine, each
//!   carrying a `ShardletId` used purely for routing.
//!
//! # Example
//!
//! ```
//! use fhirshard_core::{ShardletId, SmartId};
//!
//! let shardlet = ShardletId::hashed_from_str("Patient/123");
//! let id = SmartId::new(shardlet, 42).unwrap();
//! assert_eq!(id.shardlet_id(), shardlet);
//! assert_eq!(id.sequence(), 42);
//! ```

pub mod ids;
pub mod rows;

pub use ids::{ChangeSetId, IdError, ShardId, ShardletId, SmartId, TransactionId};
pub use rows::{
    CompartmentAssignmentRow, DateTimeSearchParamRow, QuantitySearchParamRow,
    ReferenceSearchParamRow, ResourceBatch, ResourceRow, ShardedRow, StringSearchParamRow,
    TokenQuantityCompositeSearchParamRow, TokenSearchParamRow, TokenStringCompositeSearchParamRow,
    TokenTextRow, TokenTokenCompositeSearchParamRow,
};
