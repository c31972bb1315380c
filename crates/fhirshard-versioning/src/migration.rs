//! The recurring background data-migration task.
//!
//! Work is partitioned by partition-key range. Each cycle the task lists the
//! ranges, try-acquires a per-range lock (skipping ranges another replica
//! holds), applies every pending migration to that range's documents under
//! optimistic concurrency, releases the lock, and sleeps a jittered interval.
//!
//! Ranges completed within the trailing [`DAYS_TO_CONTINUE_MONITORING`]
//! window are revisited: older service instances still rolling out may write
//! documents that predate the migration, and the window catches them.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, VersioningError};
use crate::lock::{DistributedLock, data_migration_lock_name};

/// How long to keep revisiting a completed migration range, in days.
pub const DAYS_TO_CONTINUE_MONITORING: i64 = 7;

/// Attempts per document before giving up on an etag race.
const MAX_CONCURRENCY_ATTEMPTS: u32 = 3;

/// Record id for one `(migration, partition range)` pair.
#[must_use]
pub fn migration_record_id(name: &str, partition_range: &str) -> String {
    format!("datamigration_{name}_{partition_range}")
}

/// Durable progress record of one migration over one partition range.
///
/// Created lazily on the first attempt, mutated as work progresses, never
/// deleted: the records are the migration's audit trail, and a restarted
/// task resumes by re-reading them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub id: String,
    pub name: String,
    pub partition_range: String,
    pub started: OffsetDateTime,
    pub completed: Option<OffsetDateTime>,
    pub last_exception: Option<String>,
}

/// One rolling data migration.
///
/// `apply` must be idempotent: a document already at or past
/// [`DocumentMigration::version`] is never offered to it, but replays after a
/// crash can present a document the step already transformed.
pub trait DocumentMigration: Send + Sync {
    /// Migration name, used in record ids and lock names.
    fn name(&self) -> &str;

    /// Data version a document is at once this migration has been applied.
    fn version(&self) -> i32;

    /// Transforms the document in place. Returns `false` when the document
    /// needed no change.
    fn apply(&self, doc: &mut Value) -> Result<bool>;
}

/// Configuration for the migration background task.
#[derive(Debug, Clone)]
pub struct MigrationTaskConfig {
    /// Documents fetched per batch within a range.
    pub batch_size: i64,
    /// Lower bound of the jittered sleep between cycles.
    pub min_sleep_secs: u64,
    /// Upper bound of the jittered sleep between cycles.
    pub max_sleep_secs: u64,
    /// TTL of the per-range lock.
    pub lock_ttl: Duration,
}

impl Default for MigrationTaskConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            min_sleep_secs: 60,
            max_sleep_secs: 300,
            lock_ttl: Duration::from_secs(300),
        }
    }
}

/// Picks a sleep interval uniformly from `[min, max]` seconds.
///
/// The jitter keeps multiple replicas from contending for the same range
/// locks at the same instant, cycle after cycle.
fn jittered_interval(min_secs: u64, max_secs: u64) -> Duration {
    let max = max_secs.max(min_secs);
    Duration::from_secs(rand::thread_rng().gen_range(min_secs..=max))
}

/// Returns `true` if a completed range should still be revisited.
fn within_monitoring_window(completed: OffsetDateTime, now: OffsetDateTime) -> bool {
    now - completed < time::Duration::days(DAYS_TO_CONTINUE_MONITORING)
}

/// The background task applying rolling data migrations to a collection.
pub struct MigrationTask {
    pool: PgPool,
    lock: DistributedLock,
    migrations: Vec<Arc<dyn DocumentMigration>>,
    config: MigrationTaskConfig,
}

impl MigrationTask {
    /// Creates a task over the given migrations, applied in the order given.
    #[must_use]
    pub fn new(
        pool: PgPool,
        lock: DistributedLock,
        migrations: Vec<Arc<dyn DocumentMigration>>,
        config: MigrationTaskConfig,
    ) -> Self {
        Self {
            pool,
            lock,
            migrations,
            config,
        }
    }

    /// Runs until the token is cancelled.
    ///
    /// Cycle errors are logged and do not stop the loop; cancellation only
    /// prevents the next cycle, it does not interrupt a range in flight.
    pub async fn run(&self, token: CancellationToken) {
        info!(migrations = self.migrations.len(), "Data migration task started");
        loop {
            if token.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "Migration cycle failed");
            }
            let sleep = jittered_interval(self.config.min_sleep_secs, self.config.max_sleep_secs);
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(sleep) => {}
            }
        }
        info!("Data migration task stopped");
    }

    /// Runs one full cycle over all partition ranges.
    ///
    /// Ranges locked by another instance are skipped this cycle; a failing
    /// migration abandons its range (after recording the failure) without
    /// blocking other migrations or ranges.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<()> {
        let ranges = self.list_partition_ranges().await?;
        for range in ranges {
            let lock_name = data_migration_lock_name(&range);
            let Some(guard) = self.lock.try_acquire(&lock_name).await? else {
                debug!(range, "Range locked by another instance; skipping");
                continue;
            };

            for migration in &self.migrations {
                match self.is_pending(migration.as_ref(), &range).await {
                    Ok(false) => {}
                    Ok(true) => {
                        if let Err(e) = self.run_migration(migration.as_ref(), &range).await {
                            warn!(
                                migration = migration.name(),
                                range,
                                error = %e,
                                "Migration attempt abandoned for range"
                            );
                        }
                    }
                    Err(e) => warn!(
                        migration = migration.name(),
                        range,
                        error = %e,
                        "Could not read migration record"
                    ),
                }
            }

            if let Err(e) = guard.release().await {
                warn!(range, error = %e, "Failed to release range lock; it will expire via TTL");
            }
        }
        Ok(())
    }

    /// Lists the partition-key ranges of the collection.
    pub async fn list_partition_ranges(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = query_as(
            "SELECT DISTINCT partition_range FROM version_store.documents ORDER BY partition_range",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(r,)| r).collect())
    }

    /// Fetches the progress record for one `(migration, range)` pair.
    pub async fn fetch_record(
        &self,
        name: &str,
        partition_range: &str,
    ) -> Result<Option<MigrationRecord>> {
        let row: Option<(
            String,
            String,
            String,
            OffsetDateTime,
            Option<OffsetDateTime>,
            Option<String>,
        )> = query_as(
            r#"
            SELECT id, name, partition_range, started, completed, last_exception
            FROM version_store.data_migrations
            WHERE id = $1
            "#,
        )
        .bind(migration_record_id(name, partition_range))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(id, name, partition_range, started, completed, last_exception)| MigrationRecord {
                id,
                name,
                partition_range,
                started,
                completed,
                last_exception,
            },
        ))
    }

    /// A migration is pending for a range when it never completed there, or
    /// completed recently enough to still be monitored.
    async fn is_pending(&self, migration: &dyn DocumentMigration, range: &str) -> Result<bool> {
        let record = self.fetch_record(migration.name(), range).await?;
        Ok(match record.and_then(|r| r.completed) {
            None => true,
            Some(completed) => within_monitoring_window(completed, OffsetDateTime::now_utc()),
        })
    }

    /// Applies one migration to every unmigrated document in a range.
    ///
    /// The progress record is upserted (in-progress) before any document is
    /// touched and finalized afterwards, so a crash mid-range resumes cleanly.
    #[instrument(skip(self, migration), fields(migration = migration.name()))]
    async fn run_migration(&self, migration: &dyn DocumentMigration, range: &str) -> Result<()> {
        let record_id = migration_record_id(migration.name(), range);

        // Mark in-progress; a prior completion timestamp is preserved.
        query(
            r#"
            INSERT INTO version_store.data_migrations (id, name, partition_range, started)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (id) DO UPDATE SET started = EXCLUDED.started
            "#,
        )
        .bind(&record_id)
        .bind(migration.name())
        .bind(range)
        .execute(&self.pool)
        .await?;

        let mut migrated = 0u64;
        loop {
            let doc_ids: Vec<(String,)> = query_as(
                r#"
                SELECT id FROM version_store.documents
                WHERE partition_range = $1 AND data_version < $2
                ORDER BY id
                LIMIT $3
                "#,
            )
            .bind(range)
            .bind(migration.version())
            .bind(self.config.batch_size)
            .fetch_all(&self.pool)
            .await?;

            if doc_ids.is_empty() {
                break;
            }

            for (doc_id,) in doc_ids {
                if let Err(e) = self.migrate_document(migration, range, &doc_id).await {
                    self.record_failure(&record_id, &e).await?;
                    return Err(e);
                }
                migrated += 1;
            }
        }

        // Completed is set once; revisits within the monitoring window that
        // find no work leave the original timestamp in place.
        query(
            r#"
            UPDATE version_store.data_migrations
            SET completed = COALESCE(completed, NOW()), last_exception = NULL
            WHERE id = $1
            "#,
        )
        .bind(&record_id)
        .execute(&self.pool)
        .await?;

        if migrated > 0 {
            info!(range, migrated, "Migration range complete");
        }
        Ok(())
    }

    /// Applies one migration to one document, retrying on throttling with a
    /// doubled backoff.
    async fn migrate_document(
        &self,
        migration: &dyn DocumentMigration,
        range: &str,
        doc_id: &str,
    ) -> Result<()> {
        loop {
            match self.try_migrate_document(migration, range, doc_id).await {
                Err(VersioningError::Throttled { retry_after }) => {
                    let backoff = retry_after * 2;
                    warn!(doc_id, ?backoff, "Throttled; backing off before retrying document");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    /// One optimistic-concurrency pass: read, transform, write-if-unchanged.
    async fn try_migrate_document(
        &self,
        migration: &dyn DocumentMigration,
        range: &str,
        doc_id: &str,
    ) -> Result<()> {
        for _ in 0..MAX_CONCURRENCY_ATTEMPTS {
            let row: Option<(i32, Uuid, Value)> = query_as(
                r#"
                SELECT data_version, etag, doc FROM version_store.documents
                WHERE partition_range = $1 AND id = $2
                "#,
            )
            .bind(range)
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;

            // Deleted or migrated by another replica in the meantime.
            let Some((data_version, etag, mut doc)) = row else {
                return Ok(());
            };
            if data_version >= migration.version() {
                return Ok(());
            }

            migration.apply(&mut doc)?;

            let updated = query(
                r#"
                UPDATE version_store.documents
                SET doc = $3, data_version = $4, etag = gen_random_uuid()
                WHERE partition_range = $1 AND id = $2 AND etag = $5
                "#,
            )
            .bind(range)
            .bind(doc_id)
            .bind(&doc)
            .bind(migration.version())
            .bind(etag)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 1 {
                return Ok(());
            }
            // Etag moved under us: re-read and try again.
        }

        Err(VersioningError::document_failed(
            migration.name(),
            doc_id,
            "optimistic concurrency retries exhausted",
        ))
    }

    async fn record_failure(&self, record_id: &str, error: &VersioningError) -> Result<()> {
        query("UPDATE version_store.data_migrations SET last_exception = $2 WHERE id = $1")
            .bind(record_id)
            .bind(error.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_migration_record_id_pattern() {
        assert_eq!(
            migration_record_id("search-params-v2", "range-04"),
            "datamigration_search-params-v2_range-04"
        );
    }

    #[test]
    fn test_jittered_interval_bounds() {
        for _ in 0..100 {
            let interval = jittered_interval(60, 300);
            assert!(interval >= Duration::from_secs(60));
            assert!(interval <= Duration::from_secs(300));
        }
        // Degenerate range is allowed.
        assert_eq!(jittered_interval(60, 60), Duration::from_secs(60));
    }

    #[test]
    fn test_monitoring_window() {
        let now = datetime!(2026-08-23 12:00 UTC);
        assert!(within_monitoring_window(datetime!(2026-08-20 12:00 UTC), now));
        assert!(within_monitoring_window(
            datetime!(2026-08-16 12:00:01 UTC),
            now
        ));
        assert!(!within_monitoring_window(
            datetime!(2026-08-16 12:00 UTC),
            now
        ));
        assert!(!within_monitoring_window(datetime!(2026-01-01 0:00 UTC), now));
    }

    struct AddStatus;

    impl DocumentMigration for AddStatus {
        fn name(&self) -> &str {
            "add-status"
        }

        fn version(&self) -> i32 {
            2
        }

        fn apply(&self, doc: &mut Value) -> Result<bool> {
            if doc.get("status").is_some() {
                return Ok(false);
            }
            doc["status"] = Value::String("unknown".into());
            Ok(true)
        }
    }

    #[test]
    fn test_migration_apply_is_idempotent() {
        let migration = AddStatus;
        let mut doc = serde_json::json!({"resourceType": "Observation"});

        assert!(migration.apply(&mut doc).unwrap());
        assert_eq!(doc["status"], "unknown");

        // Second application is a no-op.
        assert!(!migration.apply(&mut doc).unwrap());
        assert_eq!(doc["status"], "unknown");
    }
}
