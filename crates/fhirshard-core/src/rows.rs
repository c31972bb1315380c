//! Routed row kinds consumed by the resource merge engine.
//!
//! Every row carries a [`ShardletId`] used purely for routing; the payload is
//! opaque to the merge engine, which never mutates rows. Upsert semantics live
//! in the per-shard merge statements, not here.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::ShardletId;

/// A row that can be routed to a shard through its shardlet id.
pub trait ShardedRow {
    /// The logical partition this row belongs to.
    fn shardlet_id(&self) -> ShardletId;
}

macro_rules! impl_sharded_row {
    ($($row:ty),+ $(,)?) => {
        $(impl ShardedRow for $row {
            fn shardlet_id(&self) -> ShardletId {
                self.shardlet_id
            }
        })+
    };
}

/// A resource version to persist: the anchor row every index row refers to
/// through `(shardlet_id, sequence)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRow {
    pub shardlet_id: ShardletId,
    /// Monotonic per-shardlet surrogate sequence (bottom bits of the SmartId).
    pub sequence: i64,
    pub resource_type_id: i16,
    pub resource_id: String,
    pub version: i32,
    pub is_deleted: bool,
    /// Serialized resource payload; opaque at this layer.
    pub payload: Vec<u8>,
}

impl ResourceRow {
    /// Creates a non-deleted resource row.
    #[must_use]
    pub fn new(
        shardlet_id: ShardletId,
        sequence: i64,
        resource_type_id: i16,
        resource_id: impl Into<String>,
        version: i32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            shardlet_id,
            sequence,
            resource_type_id,
            resource_id: resource_id.into(),
            version,
            is_deleted: false,
            payload,
        }
    }
}

/// Index row for reference search parameters (`subject`, `performer`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSearchParamRow {
    pub shardlet_id: ShardletId,
    pub sequence: i64,
    pub search_param_id: i16,
    pub base_uri: Option<String>,
    pub referenced_resource_type_id: i16,
    pub referenced_resource_id: String,
}

/// Index row for token search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSearchParamRow {
    pub shardlet_id: ShardletId,
    pub sequence: i64,
    pub search_param_id: i16,
    pub system_id: Option<i32>,
    pub code: Option<String>,
}

/// Index row assigning a resource to a compartment (Patient, Encounter, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompartmentAssignmentRow {
    pub shardlet_id: ShardletId,
    pub sequence: i64,
    pub compartment_type_id: i16,
    pub referenced_resource_id: String,
}

/// Index row for full-text token search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTextRow {
    pub shardlet_id: ShardletId,
    pub sequence: i64,
    pub search_param_id: i16,
    pub text: String,
}

/// Index row for date/time search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateTimeSearchParamRow {
    pub shardlet_id: ShardletId,
    pub sequence: i64,
    pub search_param_id: i16,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    pub is_longer_than_a_day: bool,
}

/// Index row for quantity search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantitySearchParamRow {
    pub shardlet_id: ShardletId,
    pub sequence: i64,
    pub search_param_id: i16,
    pub system_id: Option<i32>,
    pub quantity_code_id: Option<i32>,
    pub single_value: Option<f64>,
    pub low_value: Option<f64>,
    pub high_value: Option<f64>,
}

/// Index row for string search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringSearchParamRow {
    pub shardlet_id: ShardletId,
    pub sequence: i64,
    pub search_param_id: i16,
    pub text: String,
    /// Overflow for values longer than the indexed prefix.
    pub text_overflow: Option<String>,
}

/// Composite index row: token + quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenQuantityCompositeSearchParamRow {
    pub shardlet_id: ShardletId,
    pub sequence: i64,
    pub search_param_id: i16,
    pub system_id: Option<i32>,
    pub code: Option<String>,
    pub quantity_system_id: Option<i32>,
    pub quantity_code_id: Option<i32>,
    pub single_value: Option<f64>,
    pub low_value: Option<f64>,
    pub high_value: Option<f64>,
}

/// Composite index row: token + token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTokenCompositeSearchParamRow {
    pub shardlet_id: ShardletId,
    pub sequence: i64,
    pub search_param_id: i16,
    pub system_id1: Option<i32>,
    pub code1: Option<String>,
    pub system_id2: Option<i32>,
    pub code2: Option<String>,
}

/// Composite index row: token + string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStringCompositeSearchParamRow {
    pub shardlet_id: ShardletId,
    pub sequence: i64,
    pub search_param_id: i16,
    pub system_id1: Option<i32>,
    pub code1: Option<String>,
    pub text2: String,
    pub text_overflow2: Option<String>,
}

impl_sharded_row!(
    ResourceRow,
    ReferenceSearchParamRow,
    TokenSearchParamRow,
    CompartmentAssignmentRow,
    TokenTextRow,
    DateTimeSearchParamRow,
    QuantitySearchParamRow,
    StringSearchParamRow,
    TokenQuantityCompositeSearchParamRow,
    TokenTokenCompositeSearchParamRow,
    TokenStringCompositeSearchParamRow,
);

/// A heterogeneous batch of resource and index-table rows, one collection per
/// row kind, submitted to the merge engine as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceBatch {
    pub resources: Vec<ResourceRow>,
    pub reference_search_params: Vec<ReferenceSearchParamRow>,
    pub token_search_params: Vec<TokenSearchParamRow>,
    pub compartment_assignments: Vec<CompartmentAssignmentRow>,
    pub token_texts: Vec<TokenTextRow>,
    pub date_time_search_params: Vec<DateTimeSearchParamRow>,
    pub token_quantity_composite_search_params: Vec<TokenQuantityCompositeSearchParamRow>,
    pub quantity_search_params: Vec<QuantitySearchParamRow>,
    pub string_search_params: Vec<StringSearchParamRow>,
    pub token_token_composite_search_params: Vec<TokenTokenCompositeSearchParamRow>,
    pub token_string_composite_search_params: Vec<TokenStringCompositeSearchParamRow>,
}

impl ResourceBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no collection holds any rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Total number of rows across all eleven collections.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.resources.len()
            + self.reference_search_params.len()
            + self.token_search_params.len()
            + self.compartment_assignments.len()
            + self.token_texts.len()
            + self.date_time_search_params.len()
            + self.token_quantity_composite_search_params.len()
            + self.quantity_search_params.len()
            + self.string_search_params.len()
            + self.token_token_composite_search_params.len()
            + self.token_string_composite_search_params.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shardlet(id: i16) -> ShardletId {
        ShardletId::new(id).unwrap()
    }

    #[test]
    fn test_empty_batch() {
        let batch = ResourceBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.row_count(), 0);
    }

    #[test]
    fn test_row_count_spans_all_collections() {
        let mut batch = ResourceBatch::new();
        batch
            .resources
            .push(ResourceRow::new(shardlet(1100), 1, 4, "abc", 1, vec![1, 2]));
        batch.token_search_params.push(TokenSearchParamRow {
            shardlet_id: shardlet(1100),
            sequence: 1,
            search_param_id: 9,
            system_id: Some(3),
            code: Some("final".into()),
        });
        batch.token_texts.push(TokenTextRow {
            shardlet_id: shardlet(1101),
            sequence: 2,
            search_param_id: 9,
            text: "blood pressure".into(),
        });

        assert!(!batch.is_empty());
        assert_eq!(batch.row_count(), 3);
    }

    #[test]
    fn test_sharded_row_routing_key() {
        let row = CompartmentAssignmentRow {
            shardlet_id: shardlet(2047),
            sequence: 10,
            compartment_type_id: 1,
            referenced_resource_id: "Patient/1".into(),
        };
        assert_eq!(row.shardlet_id(), shardlet(2047));
    }
}
