//! The resource merge engine.
//!
//! A heterogeneous [`ResourceBatch`] is partitioned by shardlet into one
//! sub-batch per shard, then every affected shard runs a single database
//! transaction covering all eleven row kinds plus the transaction-ledger
//! entry. Shards with no routed rows still record the transaction id, so the
//! ledger advances monotonically on every shard.
//!
//! Atomicity is per-shard only. A failing shard surfaces as the overall
//! error while already-committed shards stay committed; callers retry the
//! whole batch, which is safe because resource upserts are idempotent keyed
//! by resource id + version. Upgrading this to a cross-shard two-phase commit
//! would break that retry contract and is deliberately avoided.

use std::collections::BTreeMap;
use std::time::Duration;

use sqlx_core::error::Error as SqlxError;
use sqlx_core::query::query;
use sqlx_postgres::{PgPool, PgTransaction};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use fhirshard_core::{
    CompartmentAssignmentRow, DateTimeSearchParamRow, QuantitySearchParamRow,
    ReferenceSearchParamRow, ResourceBatch, ResourceRow, ShardId, ShardedRow,
    StringSearchParamRow, TokenQuantityCompositeSearchParamRow, TokenSearchParamRow,
    TokenStringCompositeSearchParamRow, TokenTextRow, TokenTokenCompositeSearchParamRow,
    TransactionId,
};

use crate::Result;
use crate::error::ShardError;
use crate::service::SqlService;
use crate::topology::ShardletMap;

/// What the merge engine will do on one shard.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardMergeAction {
    /// The shard received rows: run the full multi-table merge transaction.
    Merge(ResourceBatch),
    /// No rows routed to this shard: record the transaction id only.
    RecordOnly,
}

/// The per-shard breakdown of one merge batch.
///
/// Every shard known to the topology appears exactly once. The distinction
/// between a shard with an empty sub-batch and a shard with no sub-batch at
/// all is what drives the ledger-only call on work-free shards.
///
/// A shard counts as having work when *any* row kind routed to it, not just
/// resource rows. Index rows without an accompanying resource row should not
/// occur, but if they do, running the full merge transaction is the safe
/// choice: a ledger-only call would silently drop them.
#[derive(Debug)]
pub struct MergePlan {
    actions: BTreeMap<ShardId, ShardMergeAction>,
}

macro_rules! route_rows {
    ($map:expr, $per_shard:expr, $rows:expr, $field:ident) => {
        for row in $rows {
            let shard = $map.shard_for(row.shardlet_id())?;
            $per_shard
                .entry(shard)
                .or_insert_with(ResourceBatch::new)
                .$field
                .push(row);
        }
    };
}

impl MergePlan {
    /// Partitions every collection of the batch independently by
    /// `shard = topology[row.shardlet_id]`.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::UnknownShardlet`] if any row references a
    /// shardlet outside the topology map.
    pub fn partition(map: &ShardletMap, batch: ResourceBatch) -> Result<Self> {
        let mut per_shard: BTreeMap<ShardId, ResourceBatch> = BTreeMap::new();

        let ResourceBatch {
            resources,
            reference_search_params,
            token_search_params,
            compartment_assignments,
            token_texts,
            date_time_search_params,
            token_quantity_composite_search_params,
            quantity_search_params,
            string_search_params,
            token_token_composite_search_params,
            token_string_composite_search_params,
        } = batch;

        route_rows!(map, per_shard, resources, resources);
        route_rows!(map, per_shard, reference_search_params, reference_search_params);
        route_rows!(map, per_shard, token_search_params, token_search_params);
        route_rows!(map, per_shard, compartment_assignments, compartment_assignments);
        route_rows!(map, per_shard, token_texts, token_texts);
        route_rows!(map, per_shard, date_time_search_params, date_time_search_params);
        route_rows!(
            map,
            per_shard,
            token_quantity_composite_search_params,
            token_quantity_composite_search_params
        );
        route_rows!(map, per_shard, quantity_search_params, quantity_search_params);
        route_rows!(map, per_shard, string_search_params, string_search_params);
        route_rows!(
            map,
            per_shard,
            token_token_composite_search_params,
            token_token_composite_search_params
        );
        route_rows!(
            map,
            per_shard,
            token_string_composite_search_params,
            token_string_composite_search_params
        );

        let mut actions = BTreeMap::new();
        for shard_id in map.shard_ids() {
            let action = match per_shard.remove(&shard_id) {
                Some(sub) => ShardMergeAction::Merge(sub),
                None => ShardMergeAction::RecordOnly,
            };
            actions.insert(shard_id, action);
        }

        Ok(Self { actions })
    }

    /// The planned action per shard, in shard-id order.
    #[must_use]
    pub fn actions(&self) -> &BTreeMap<ShardId, ShardMergeAction> {
        &self.actions
    }

    /// Consumes the plan into its per-shard actions.
    #[must_use]
    pub fn into_actions(self) -> BTreeMap<ShardId, ShardMergeAction> {
        self.actions
    }
}

impl SqlService {
    /// Merges a batch of resource and index rows across all shards.
    ///
    /// Per shard, in parallel: shards with routed rows run one atomic
    /// multi-table transaction (upsert resources, replace index rows, record
    /// the transaction id); work-free shards record the transaction id only.
    /// Returns the sum of per-shard affected-row counts.
    ///
    /// The cancellation token stops shard dispatches that have not started;
    /// in-flight shard transactions run to completion and are awaited.
    ///
    /// # Errors
    ///
    /// The first per-shard failure becomes the overall error. Other shards
    /// are not rolled back; resubmit the batch to converge.
    #[instrument(
        skip(self, batch, token),
        fields(transaction_id = %transaction_id, rows = batch.row_count())
    )]
    pub async fn merge_resources(
        &self,
        transaction_id: TransactionId,
        batch: ResourceBatch,
        token: &CancellationToken,
    ) -> Result<u64> {
        let plan = MergePlan::partition(self.map(), batch)?;
        let merge_timeout = Duration::from_secs(self.config().merge_command_timeout_secs);
        let control_timeout = Duration::from_secs(self.config().control_command_timeout_secs);

        let mut join_set = JoinSet::new();
        let mut first_err: Option<ShardError> = None;

        for (shard_id, action) in plan.into_actions() {
            if token.is_cancelled() {
                first_err.get_or_insert(ShardError::Canceled);
                break;
            }
            let pool = match self.pool(Some(shard_id)) {
                Ok(pool) => pool,
                Err(e) => {
                    first_err.get_or_insert(e);
                    break;
                }
            };
            join_set.spawn(run_shard_action(
                pool,
                shard_id,
                transaction_id,
                action,
                merge_timeout,
                control_timeout,
            ));
        }

        // Per-shard-keyed accumulation; the branches share no counter.
        let mut per_shard_counts: BTreeMap<ShardId, u64> = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((shard_id, Ok(count))) => {
                    debug!(shard_id = %shard_id, affected = count, "Shard merge complete");
                    per_shard_counts.insert(shard_id, count);
                }
                Ok((_, Err(e))) => {
                    first_err.get_or_insert(e);
                }
                Err(join_err) => {
                    first_err.get_or_insert(ShardError::Task {
                        message: join_err.to_string(),
                    });
                }
            }
        }

        if let Some(e) = first_err {
            return Err(e);
        }

        let total = per_shard_counts.values().sum();
        info!(
            transaction_id = %transaction_id,
            shards = per_shard_counts.len(),
            affected = total,
            "Merge complete"
        );
        Ok(total)
    }
}

async fn run_shard_action(
    pool: PgPool,
    shard_id: ShardId,
    transaction_id: TransactionId,
    action: ShardMergeAction,
    merge_timeout: Duration,
    control_timeout: Duration,
) -> (ShardId, Result<u64>) {
    let result = match action {
        ShardMergeAction::Merge(sub) => {
            match tokio::time::timeout(merge_timeout, merge_shard(&pool, transaction_id, sub))
                .await
            {
                Ok(Ok(count)) => Ok(count),
                Ok(Err(e)) => Err(ShardError::merge(shard_id, e)),
                Err(_) => Err(ShardError::CommandTimeout {
                    seconds: merge_timeout.as_secs(),
                }),
            }
        }
        ShardMergeAction::RecordOnly => {
            match tokio::time::timeout(
                control_timeout,
                record_shard_transaction(&pool, transaction_id),
            )
            .await
            {
                Ok(Ok(())) => Ok(0),
                Ok(Err(e)) => Err(ShardError::merge(shard_id, e)),
                Err(_) => Err(ShardError::CommandTimeout {
                    seconds: control_timeout.as_secs(),
                }),
            }
        }
    };
    (shard_id, result)
}

/// Index tables whose rows are replaced per merged resource.
const INDEX_TABLES: [&str; 10] = [
    "reference_search_params",
    "token_search_params",
    "compartment_assignments",
    "token_texts",
    "date_time_search_params",
    "token_quantity_composite_search_params",
    "quantity_search_params",
    "string_search_params",
    "token_token_composite_search_params",
    "token_string_composite_search_params",
];

/// Runs the full multi-table merge on one shard, atomically.
///
/// Upserts the resource rows, replaces all index rows belonging to those
/// resources, and records the transaction id, all in one database
/// transaction. Returns the number of inserted/updated rows (index-row
/// deletions are not counted).
async fn merge_shard(
    pool: &PgPool,
    transaction_id: TransactionId,
    batch: ResourceBatch,
) -> std::result::Result<u64, SqlxError> {
    let mut txn = pool.begin().await?;
    let mut affected = 0u64;

    let key_shardlets: Vec<i16> = batch.resources.iter().map(|r| r.shardlet_id.value()).collect();
    let key_sequences: Vec<i64> = batch.resources.iter().map(|r| r.sequence).collect();

    for table in INDEX_TABLES {
        delete_index_rows(&mut txn, table, &key_shardlets, &key_sequences).await?;
    }

    affected += upsert_resources(&mut txn, &batch.resources).await?;
    affected += insert_reference_search_params(&mut txn, &batch.reference_search_params).await?;
    affected += insert_token_search_params(&mut txn, &batch.token_search_params).await?;
    affected += insert_compartment_assignments(&mut txn, &batch.compartment_assignments).await?;
    affected += insert_token_texts(&mut txn, &batch.token_texts).await?;
    affected += insert_date_time_search_params(&mut txn, &batch.date_time_search_params).await?;
    affected += insert_token_quantity_composites(
        &mut txn,
        &batch.token_quantity_composite_search_params,
    )
    .await?;
    affected += insert_quantity_search_params(&mut txn, &batch.quantity_search_params).await?;
    affected += insert_string_search_params(&mut txn, &batch.string_search_params).await?;
    affected +=
        insert_token_token_composites(&mut txn, &batch.token_token_composite_search_params).await?;
    affected += insert_token_string_composites(
        &mut txn,
        &batch.token_string_composite_search_params,
    )
    .await?;

    query(
        r#"
        INSERT INTO shard.transactions (transaction_id, status, committed_at)
        VALUES ($1, 'committed', NOW())
        ON CONFLICT (transaction_id) DO NOTHING
        "#,
    )
    .bind(transaction_id.value())
    .execute(&mut *txn)
    .await?;

    txn.commit().await?;
    Ok(affected)
}

/// Records a transaction id in a shard's ledger without row work.
pub(crate) async fn record_shard_transaction(
    pool: &PgPool,
    transaction_id: TransactionId,
) -> std::result::Result<(), SqlxError> {
    query(
        r#"
        INSERT INTO shard.transactions (transaction_id, status, committed_at)
        VALUES ($1, 'committed', NOW())
        ON CONFLICT (transaction_id) DO NOTHING
        "#,
    )
    .bind(transaction_id.value())
    .execute(pool)
    .await?;
    Ok(())
}

async fn delete_index_rows(
    txn: &mut PgTransaction<'_>,
    table: &str,
    shardlet_ids: &[i16],
    sequence_ids: &[i64],
) -> std::result::Result<u64, SqlxError> {
    if shardlet_ids.is_empty() {
        return Ok(0);
    }
    // Table names come from the static INDEX_TABLES list, never from input.
    let sql = format!(
        "DELETE FROM shard.{table} \
         WHERE (shardlet_id, sequence_id) IN (SELECT * FROM UNNEST($1::smallint[], $2::bigint[]))"
    );
    let result = query(&sql)
        .bind(shardlet_ids)
        .bind(sequence_ids)
        .execute(&mut **txn)
        .await?;
    Ok(result.rows_affected())
}

async fn upsert_resources(
    txn: &mut PgTransaction<'_>,
    rows: &[ResourceRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let resource_type_ids: Vec<i16> = rows.iter().map(|r| r.resource_type_id).collect();
    let resource_ids: Vec<String> = rows.iter().map(|r| r.resource_id.clone()).collect();
    let versions: Vec<i32> = rows.iter().map(|r| r.version).collect();
    let deleted: Vec<bool> = rows.iter().map(|r| r.is_deleted).collect();
    let payloads: Vec<Vec<u8>> = rows.iter().map(|r| r.payload.clone()).collect();

    let result = query(
        r#"
        INSERT INTO shard.resources
            (shardlet_id, sequence_id, resource_type_id, resource_id, version, is_deleted, payload)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::text[], $5::int[], $6::boolean[], $7::bytea[])
        ON CONFLICT (shardlet_id, sequence_id) DO UPDATE SET
            resource_type_id = EXCLUDED.resource_type_id,
            resource_id = EXCLUDED.resource_id,
            version = EXCLUDED.version,
            is_deleted = EXCLUDED.is_deleted,
            payload = EXCLUDED.payload
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(resource_type_ids)
    .bind(resource_ids)
    .bind(versions)
    .bind(deleted)
    .bind(payloads)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_reference_search_params(
    txn: &mut PgTransaction<'_>,
    rows: &[ReferenceSearchParamRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let search_param_ids: Vec<i16> = rows.iter().map(|r| r.search_param_id).collect();
    let base_uris: Vec<Option<String>> = rows.iter().map(|r| r.base_uri.clone()).collect();
    let ref_type_ids: Vec<i16> = rows.iter().map(|r| r.referenced_resource_type_id).collect();
    let ref_ids: Vec<String> = rows.iter().map(|r| r.referenced_resource_id.clone()).collect();

    let result = query(
        r#"
        INSERT INTO shard.reference_search_params
            (shardlet_id, sequence_id, search_param_id, base_uri, referenced_resource_type_id, referenced_resource_id)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::text[], $5::smallint[], $6::text[])
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(search_param_ids)
    .bind(base_uris)
    .bind(ref_type_ids)
    .bind(ref_ids)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_token_search_params(
    txn: &mut PgTransaction<'_>,
    rows: &[TokenSearchParamRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let search_param_ids: Vec<i16> = rows.iter().map(|r| r.search_param_id).collect();
    let system_ids: Vec<Option<i32>> = rows.iter().map(|r| r.system_id).collect();
    let codes: Vec<Option<String>> = rows.iter().map(|r| r.code.clone()).collect();

    let result = query(
        r#"
        INSERT INTO shard.token_search_params
            (shardlet_id, sequence_id, search_param_id, system_id, code)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::int[], $5::text[])
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(search_param_ids)
    .bind(system_ids)
    .bind(codes)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_compartment_assignments(
    txn: &mut PgTransaction<'_>,
    rows: &[CompartmentAssignmentRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let compartment_type_ids: Vec<i16> = rows.iter().map(|r| r.compartment_type_id).collect();
    let ref_ids: Vec<String> = rows.iter().map(|r| r.referenced_resource_id.clone()).collect();

    let result = query(
        r#"
        INSERT INTO shard.compartment_assignments
            (shardlet_id, sequence_id, compartment_type_id, referenced_resource_id)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::text[])
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(compartment_type_ids)
    .bind(ref_ids)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_token_texts(
    txn: &mut PgTransaction<'_>,
    rows: &[TokenTextRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let search_param_ids: Vec<i16> = rows.iter().map(|r| r.search_param_id).collect();
    let texts: Vec<String> = rows.iter().map(|r| r.text.clone()).collect();

    let result = query(
        r#"
        INSERT INTO shard.token_texts (shardlet_id, sequence_id, search_param_id, text)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::text[])
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(search_param_ids)
    .bind(texts)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_date_time_search_params(
    txn: &mut PgTransaction<'_>,
    rows: &[DateTimeSearchParamRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let search_param_ids: Vec<i16> = rows.iter().map(|r| r.search_param_id).collect();
    let start_times: Vec<time::OffsetDateTime> = rows.iter().map(|r| r.start_time).collect();
    let end_times: Vec<time::OffsetDateTime> = rows.iter().map(|r| r.end_time).collect();
    let longer_than_a_day: Vec<bool> = rows.iter().map(|r| r.is_longer_than_a_day).collect();

    let result = query(
        r#"
        INSERT INTO shard.date_time_search_params
            (shardlet_id, sequence_id, search_param_id, start_time, end_time, is_longer_than_a_day)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::timestamptz[], $5::timestamptz[], $6::boolean[])
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(search_param_ids)
    .bind(start_times)
    .bind(end_times)
    .bind(longer_than_a_day)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_token_quantity_composites(
    txn: &mut PgTransaction<'_>,
    rows: &[TokenQuantityCompositeSearchParamRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let search_param_ids: Vec<i16> = rows.iter().map(|r| r.search_param_id).collect();
    let system_ids: Vec<Option<i32>> = rows.iter().map(|r| r.system_id).collect();
    let codes: Vec<Option<String>> = rows.iter().map(|r| r.code.clone()).collect();
    let quantity_system_ids: Vec<Option<i32>> = rows.iter().map(|r| r.quantity_system_id).collect();
    let quantity_code_ids: Vec<Option<i32>> = rows.iter().map(|r| r.quantity_code_id).collect();
    let single_values: Vec<Option<f64>> = rows.iter().map(|r| r.single_value).collect();
    let low_values: Vec<Option<f64>> = rows.iter().map(|r| r.low_value).collect();
    let high_values: Vec<Option<f64>> = rows.iter().map(|r| r.high_value).collect();

    let result = query(
        r#"
        INSERT INTO shard.token_quantity_composite_search_params
            (shardlet_id, sequence_id, search_param_id, system_id, code,
             quantity_system_id, quantity_code_id, single_value, low_value, high_value)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::int[], $5::text[],
                             $6::int[], $7::int[], $8::float8[], $9::float8[], $10::float8[])
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(search_param_ids)
    .bind(system_ids)
    .bind(codes)
    .bind(quantity_system_ids)
    .bind(quantity_code_ids)
    .bind(single_values)
    .bind(low_values)
    .bind(high_values)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_quantity_search_params(
    txn: &mut PgTransaction<'_>,
    rows: &[QuantitySearchParamRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let search_param_ids: Vec<i16> = rows.iter().map(|r| r.search_param_id).collect();
    let system_ids: Vec<Option<i32>> = rows.iter().map(|r| r.system_id).collect();
    let quantity_code_ids: Vec<Option<i32>> = rows.iter().map(|r| r.quantity_code_id).collect();
    let single_values: Vec<Option<f64>> = rows.iter().map(|r| r.single_value).collect();
    let low_values: Vec<Option<f64>> = rows.iter().map(|r| r.low_value).collect();
    let high_values: Vec<Option<f64>> = rows.iter().map(|r| r.high_value).collect();

    let result = query(
        r#"
        INSERT INTO shard.quantity_search_params
            (shardlet_id, sequence_id, search_param_id, system_id, quantity_code_id,
             single_value, low_value, high_value)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::int[], $5::int[],
                             $6::float8[], $7::float8[], $8::float8[])
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(search_param_ids)
    .bind(system_ids)
    .bind(quantity_code_ids)
    .bind(single_values)
    .bind(low_values)
    .bind(high_values)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_string_search_params(
    txn: &mut PgTransaction<'_>,
    rows: &[StringSearchParamRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let search_param_ids: Vec<i16> = rows.iter().map(|r| r.search_param_id).collect();
    let texts: Vec<String> = rows.iter().map(|r| r.text.clone()).collect();
    let overflows: Vec<Option<String>> = rows.iter().map(|r| r.text_overflow.clone()).collect();

    let result = query(
        r#"
        INSERT INTO shard.string_search_params
            (shardlet_id, sequence_id, search_param_id, text, text_overflow)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::text[], $5::text[])
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(search_param_ids)
    .bind(texts)
    .bind(overflows)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_token_token_composites(
    txn: &mut PgTransaction<'_>,
    rows: &[TokenTokenCompositeSearchParamRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let search_param_ids: Vec<i16> = rows.iter().map(|r| r.search_param_id).collect();
    let system_id1s: Vec<Option<i32>> = rows.iter().map(|r| r.system_id1).collect();
    let code1s: Vec<Option<String>> = rows.iter().map(|r| r.code1.clone()).collect();
    let system_id2s: Vec<Option<i32>> = rows.iter().map(|r| r.system_id2).collect();
    let code2s: Vec<Option<String>> = rows.iter().map(|r| r.code2.clone()).collect();

    let result = query(
        r#"
        INSERT INTO shard.token_token_composite_search_params
            (shardlet_id, sequence_id, search_param_id, system_id1, code1, system_id2, code2)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::int[], $5::text[], $6::int[], $7::text[])
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(search_param_ids)
    .bind(system_id1s)
    .bind(code1s)
    .bind(system_id2s)
    .bind(code2s)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_token_string_composites(
    txn: &mut PgTransaction<'_>,
    rows: &[TokenStringCompositeSearchParamRow],
) -> std::result::Result<u64, SqlxError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let shardlet_ids: Vec<i16> = rows.iter().map(|r| r.shardlet_id.value()).collect();
    let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    let search_param_ids: Vec<i16> = rows.iter().map(|r| r.search_param_id).collect();
    let system_id1s: Vec<Option<i32>> = rows.iter().map(|r| r.system_id1).collect();
    let code1s: Vec<Option<String>> = rows.iter().map(|r| r.code1.clone()).collect();
    let text2s: Vec<String> = rows.iter().map(|r| r.text2.clone()).collect();
    let overflow2s: Vec<Option<String>> = rows.iter().map(|r| r.text_overflow2.clone()).collect();

    let result = query(
        r#"
        INSERT INTO shard.token_string_composite_search_params
            (shardlet_id, sequence_id, search_param_id, system_id1, code1, text2, text_overflow2)
        SELECT * FROM UNNEST($1::smallint[], $2::bigint[], $3::smallint[], $4::int[], $5::text[], $6::text[], $7::text[])
        "#,
    )
    .bind(shardlet_ids)
    .bind(sequence_ids)
    .bind(search_param_ids)
    .bind(system_id1s)
    .bind(code1s)
    .bind(text2s)
    .bind(overflow2s)
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ShardletMapRow;
    use fhirshard_core::ShardletId;

    fn map() -> ShardletMap {
        let rows = vec![
            ShardletMapRow {
                shard_id: 0,
                connection_string: "postgres://localhost/shard_0".into(),
                shardlet_id: Some(1024),
                shard_version: 1,
            },
            ShardletMapRow {
                shard_id: 0,
                connection_string: "postgres://localhost/shard_0".into(),
                shardlet_id: Some(1026),
                shard_version: 1,
            },
            ShardletMapRow {
                shard_id: 1,
                connection_string: "postgres://localhost/shard_1".into(),
                shardlet_id: Some(1025),
                shard_version: 1,
            },
        ];
        ShardletMap::from_rows(rows, None).unwrap()
    }

    fn shardlet(id: i16) -> ShardletId {
        ShardletId::new(id).unwrap()
    }

    fn resource(shardlet_id: i16, sequence: i64) -> ResourceRow {
        ResourceRow::new(shardlet(shardlet_id), sequence, 4, "Patient/1", 1, vec![0xde])
    }

    #[test]
    fn test_partition_distinguishes_work_free_shards() {
        let map = map();
        let mut batch = ResourceBatch::new();
        // Rows for shard 0 only (shardlets 1024 and 1026).
        batch.resources.push(resource(1024, 1));
        batch.resources.push(resource(1026, 2));
        batch.token_search_params.push(TokenSearchParamRow {
            shardlet_id: shardlet(1024),
            sequence: 1,
            search_param_id: 9,
            system_id: None,
            code: Some("final".into()),
        });

        let plan = MergePlan::partition(&map, batch).unwrap();
        assert_eq!(plan.actions().len(), 2);

        match plan.actions().get(&ShardId::new(0)).unwrap() {
            ShardMergeAction::Merge(sub) => {
                assert_eq!(sub.resources.len(), 2);
                assert_eq!(sub.token_search_params.len(), 1);
            }
            other => panic!("expected Merge for shard 0, got {other:?}"),
        }

        // Shard 1 got no rows: ledger-only, not an empty merge.
        assert_eq!(
            plan.actions().get(&ShardId::new(1)),
            Some(&ShardMergeAction::RecordOnly)
        );
    }

    #[test]
    fn test_partition_routes_every_collection_independently() {
        let map = map();
        let mut batch = ResourceBatch::new();
        batch.resources.push(resource(1024, 1));
        // Index row routed to a different shard than the resource row.
        batch.token_texts.push(TokenTextRow {
            shardlet_id: shardlet(1025),
            sequence: 7,
            search_param_id: 3,
            text: "bp".into(),
        });

        let plan = MergePlan::partition(&map, batch).unwrap();
        match plan.actions().get(&ShardId::new(1)).unwrap() {
            ShardMergeAction::Merge(sub) => {
                assert!(sub.resources.is_empty());
                assert_eq!(sub.token_texts.len(), 1);
            }
            other => panic!("expected Merge for shard 1, got {other:?}"),
        }
    }

    #[test]
    fn test_partition_rejects_unknown_shardlet() {
        let map = map();
        let mut batch = ResourceBatch::new();
        batch.resources.push(resource(2000, 1));

        let err = MergePlan::partition(&map, batch).unwrap_err();
        assert!(matches!(err, ShardError::UnknownShardlet(_)));
    }

    #[test]
    fn test_empty_batch_is_record_only_everywhere() {
        let map = map();
        let plan = MergePlan::partition(&map, ResourceBatch::new()).unwrap();
        assert!(
            plan.actions()
                .values()
                .all(|a| *a == ShardMergeAction::RecordOnly)
        );
    }
}
