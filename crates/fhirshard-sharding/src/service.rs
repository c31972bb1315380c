//! Shard-aware SQL execution.
//!
//! [`SqlService`] owns the immutable [`ShardletMap`] and a lazily-built cache
//! of per-shard connection pools. It provides transient-error retry with a
//! rolling timeout window, sequential and parallel per-shard fan-out, and the
//! shard transaction lifecycle (begin / heartbeat / commit).
//!
//! No cross-shard transactionality exists at this layer: atomicity is
//! per-shard only.

use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sqlx_core::error::Error as SqlxError;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::{PgPool, PgPoolOptions};
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use fhirshard_core::{ShardId, TransactionId};

use crate::config::ShardingConfig;
use crate::error::{ShardError, is_transient};
use crate::topology::ShardletMap;
use crate::Result;

/// Executes operations against one, several, or all shards.
#[derive(Debug)]
pub struct SqlService {
    map: ShardletMap,
    config: ShardingConfig,
    /// Lazily-created pools; `None` keys the central metadata store.
    pools: DashMap<Option<ShardId>, PgPool>,
}

impl SqlService {
    /// Creates a service over an already-loaded topology map.
    ///
    /// No connections are opened here; pools are created lazily on first use.
    #[must_use]
    pub fn new(map: ShardletMap, config: ShardingConfig) -> Self {
        Self {
            map,
            config,
            pools: DashMap::new(),
        }
    }

    /// The topology map this service routes through.
    #[must_use]
    pub fn map(&self) -> &ShardletMap {
        &self.map
    }

    /// The configuration this service was built with.
    #[must_use]
    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    /// Returns the pool for a shard, or the central store for `None`.
    ///
    /// Pools are created lazily and cached for the lifetime of the service.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::UnknownShard`] for shards outside the topology.
    pub fn pool(&self, shard_id: Option<ShardId>) -> Result<PgPool> {
        if let Some(pool) = self.pools.get(&shard_id) {
            return Ok(pool.clone());
        }

        let url = match shard_id {
            None => self.config.central_url.clone(),
            Some(id) => self
                .map
                .shard(id)
                .ok_or(ShardError::UnknownShard(id))?
                .connection_string
                .clone(),
        };

        let pool = PgPoolOptions::new()
            .max_connections(self.config.pool_size)
            .acquire_timeout(Duration::from_secs(self.config.acquire_timeout_secs))
            .connect_lazy(&url)?;

        // Two racing creators both produce a valid pool; keep the first.
        let entry = self.pools.entry(shard_id).or_insert(pool);
        Ok(entry.clone())
    }

    /// Runs an operation, retrying transient failures with a fixed delay.
    ///
    /// The retry budget is a rolling window of `connection_timeout_secs`
    /// measured from the first failure of the current streak; a successful
    /// attempt ends the streak (and the call). Non-transient errors propagate
    /// immediately.
    pub async fn execute_with_retries<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, SqlxError>>,
    {
        let window = Duration::from_secs(self.config.connection_timeout_secs);
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut streak_start: Option<Instant> = None;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    let start = *streak_start.get_or_insert_with(Instant::now);
                    if start.elapsed() + delay >= window {
                        warn!(error = %e, "Retry window exhausted");
                        return Err(ShardError::RetryTimeout {
                            seconds: self.config.connection_timeout_secs,
                        });
                    }
                    warn!(error = %e, delay_ms = self.config.retry_delay_ms, "Transient database error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Runs an operation against every shard sequentially, in shard-id order.
    pub async fn for_each_shard<F, Fut>(&self, mut op: F) -> Result<()>
    where
        F: FnMut(ShardId) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        for shard_id in self.map.shard_ids() {
            op(shard_id).await?;
        }
        Ok(())
    }

    /// Runs an operation against every shard concurrently.
    ///
    /// The first error encountered becomes the overall result. Cancellation
    /// prevents shard operations that have not been dispatched yet; in-flight
    /// operations run to completion (success or failure) and are awaited.
    pub async fn parallel_for_each_shard<F, Fut>(
        &self,
        op: F,
        token: &CancellationToken,
    ) -> Result<()>
    where
        F: Fn(ShardId) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut join_set = JoinSet::new();
        let mut first_err: Option<ShardError> = None;

        for shard_id in self.map.shard_ids() {
            if token.is_cancelled() {
                first_err = Some(ShardError::Canceled);
                break;
            }
            join_set.spawn(op(shard_id));
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(ShardError::Task {
                            message: join_err.to_string(),
                        });
                    }
                }
            }
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Opens a logical write transaction and returns its id.
    ///
    /// `shard_id = None` allocates against the central store, which is how
    /// cross-shard merge transactions obtain their id before fan-out.
    #[instrument(skip(self, definition))]
    pub async fn begin_transaction(
        &self,
        shard_id: Option<ShardId>,
        definition: Option<&str>,
        timeout_secs: i32,
    ) -> Result<TransactionId> {
        let pool = self.pool(shard_id)?;
        let raw: i64 = self
            .control_call(
                query_scalar(
                    r#"
                    INSERT INTO shard.transactions (definition, status, timeout_secs, heartbeat_at)
                    VALUES ($1, 'active', $2, NOW())
                    RETURNING transaction_id
                    "#,
                )
                .bind(definition)
                .bind(timeout_secs)
                .fetch_one(&pool),
            )
            .await?;

        debug!(transaction_id = raw, "Transaction opened");
        Ok(TransactionId::new(raw))
    }

    /// Records a heartbeat for a long-running transaction.
    ///
    /// `heartbeat_at = None` stamps the database's current time.
    pub async fn put_transaction_heartbeat(
        &self,
        shard_id: Option<ShardId>,
        transaction_id: TransactionId,
        heartbeat_at: Option<OffsetDateTime>,
    ) -> Result<()> {
        let pool = self.pool(shard_id)?;
        self.control_call(
            query(
                r#"
                UPDATE shard.transactions
                SET heartbeat_at = COALESCE($2, NOW())
                WHERE transaction_id = $1
                "#,
            )
            .bind(transaction_id.value())
            .bind(heartbeat_at)
            .execute(&pool),
        )
        .await?;
        Ok(())
    }

    /// Completes a transaction, as committed or failed.
    ///
    /// A non-`None` `failure_reason` marks the transaction failed;
    /// `is_watchdog` flags completions issued by the watchdog rather than the
    /// original writer.
    #[instrument(skip(self, failure_reason))]
    pub async fn commit_transaction(
        &self,
        shard_id: Option<ShardId>,
        transaction_id: TransactionId,
        failure_reason: Option<&str>,
        is_watchdog: bool,
    ) -> Result<()> {
        let pool = self.pool(shard_id)?;
        self.control_call(
            query(
                r#"
                UPDATE shard.transactions
                SET status = CASE WHEN $2::text IS NULL THEN 'committed' ELSE 'failed' END,
                    failure_reason = $2,
                    is_watchdog = $3,
                    committed_at = NOW()
                WHERE transaction_id = $1
                "#,
            )
            .bind(transaction_id.value())
            .bind(failure_reason)
            .bind(is_watchdog)
            .execute(&pool),
        )
        .await?;
        Ok(())
    }

    /// Records a transaction id in a shard's ledger without any row work.
    ///
    /// Work-free shards still observe every transaction id, which keeps the
    /// ledger monotonic on all shards for cross-shard consistency checks.
    pub async fn put_shard_transaction(
        &self,
        shard_id: ShardId,
        transaction_id: TransactionId,
    ) -> Result<()> {
        let pool = self.pool(Some(shard_id))?;
        self.control_call(crate::merge::record_shard_transaction(&pool, transaction_id))
            .await
    }

    /// Applies the control-plane command timeout to a database call.
    pub(crate) async fn control_call<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, SqlxError>>,
    ) -> Result<T> {
        let seconds = self.config.control_command_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(seconds), fut).await {
            Ok(result) => result.map_err(ShardError::from),
            Err(_) => Err(ShardError::CommandTimeout { seconds }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::topology::ShardletMapRow;

    fn two_shard_service() -> SqlService {
        let rows = vec![
            ShardletMapRow {
                shard_id: 0,
                connection_string: "postgres://localhost/shard_0".into(),
                shardlet_id: Some(1024),
                shard_version: 1,
            },
            ShardletMapRow {
                shard_id: 1,
                connection_string: "postgres://localhost/shard_1".into(),
                shardlet_id: Some(1025),
                shard_version: 1,
            },
        ];
        let map = ShardletMap::from_rows(rows, None).unwrap();
        SqlService::new(map, ShardingConfig::default())
    }

    #[tokio::test]
    async fn test_parallel_for_each_shard_visits_every_shard() {
        let service = two_shard_service();
        let visited = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let counter = visited.clone();
        service
            .parallel_for_each_shard(
                move |_shard| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                &token,
            )
            .await
            .unwrap();

        assert_eq!(visited.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_parallel_for_each_shard_propagates_first_error() {
        let service = two_shard_service();
        let token = CancellationToken::new();

        let result = service
            .parallel_for_each_shard(
                |shard| async move {
                    if shard == ShardId::new(1) {
                        Err(ShardError::config("shard 1 exploded"))
                    } else {
                        Ok(())
                    }
                },
                &token,
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("shard 1 exploded"), "got: {err}");
    }

    #[tokio::test]
    async fn test_parallel_for_each_shard_cancelled_before_dispatch() {
        let service = two_shard_service();
        let token = CancellationToken::new();
        token.cancel();

        let visited = Arc::new(AtomicUsize::new(0));
        let counter = visited.clone();
        let result = service
            .parallel_for_each_shard(
                move |_shard| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                &token,
            )
            .await;

        assert!(matches!(result, Err(ShardError::Canceled)));
        assert_eq!(visited.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_with_retries_returns_after_transient_failures() {
        let service = two_shard_service();
        let attempts = Arc::new(AtomicUsize::new(0));

        // Shrink the delay so the test completes quickly.
        let config = ShardingConfig::default().with_retry_delay_ms(1);
        let service = SqlService::new(service.map.clone(), config);

        let counter = attempts.clone();
        let value = service
            .execute_with_retries(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SqlxError::PoolTimedOut)
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_with_retries_fatal_error_propagates_immediately() {
        let service = two_shard_service();
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let result: Result<u32> = service
            .execute_with_retries(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SqlxError::RowNotFound)
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_with_retries_window_exhaustion() {
        let rows = vec![ShardletMapRow {
            shard_id: 0,
            connection_string: "postgres://localhost/shard_0".into(),
            shardlet_id: Some(1024),
            shard_version: 1,
        }];
        let map = ShardletMap::from_rows(rows, None).unwrap();
        let config = ShardingConfig::default()
            .with_retry_delay_ms(50)
            .with_connection_timeout_secs(0);
        let service = SqlService::new(map, config);

        let result: Result<u32> = service
            .execute_with_retries(|| async { Err(SqlxError::PoolTimedOut) })
            .await;

        assert!(matches!(result, Err(ShardError::RetryTimeout { seconds: 0 })));
    }

    #[test]
    fn test_pool_rejects_unknown_shard() {
        let service = two_shard_service();
        let result = service.pool(Some(ShardId::new(9)));
        assert!(matches!(result, Err(ShardError::UnknownShard(_))));
    }

    #[tokio::test]
    async fn test_pool_uses_configured_acquire_timeout() {
        let service = two_shard_service();
        let config = ShardingConfig::default().with_acquire_timeout_secs(7);
        let service = SqlService::new(service.map.clone(), config);

        let pool = service.pool(Some(ShardId::new(0))).unwrap();
        assert_eq!(
            pool.options().get_acquire_timeout(),
            Duration::from_secs(7)
        );
    }

    #[tokio::test]
    async fn test_pool_is_cached() {
        let service = two_shard_service();
        service.pool(Some(ShardId::new(0))).unwrap();
        service.pool(Some(ShardId::new(0))).unwrap();
        assert_eq!(service.pools.len(), 1);
    }
}
