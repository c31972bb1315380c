//! Named distributed locks over the version store.
//!
//! Locks are rows in `version_store.locks` with a TTL. Acquisition is an
//! insert-or-steal-expired upsert, so a crashed holder's lock becomes
//! acquirable once its TTL lapses without any cleanup task.
//!
//! [`DistributedLock::try_acquire`] is non-blocking by design: the migration
//! task uses it to *skip* ranges another replica is working on. Upgrading it
//! to a blocking acquire would serialize all replicas onto one range at a
//! time and defeat the cross-range parallelism.

use std::time::{Duration, Instant};

use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, VersioningError};

/// Lock name for a collection upgrade to the given data version.
#[must_use]
pub fn upgrade_lock_name(version: i32) -> String {
    format!("UpgradeLock:{version}")
}

/// Lock name for migrating one partition-key range.
#[must_use]
pub fn data_migration_lock_name(partition_range: &str) -> String {
    format!("Lock:DataMigration:{partition_range}")
}

/// Delay between attempts of a blocking [`DistributedLock::acquire`].
const ACQUIRE_POLL_DELAY: Duration = Duration::from_secs(1);

/// Factory for named, TTL-bounded distributed locks.
///
/// Each instance has its own owner identity; guards it hands out can only be
/// released (or re-stolen before expiry) by the same owner.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    pool: PgPool,
    owner: Uuid,
    ttl: Duration,
}

impl DistributedLock {
    /// Creates a lock factory with a fresh owner identity.
    #[must_use]
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            owner: Uuid::new_v4(),
            ttl,
        }
    }

    /// This instance's owner identity.
    #[must_use]
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Attempts to take the named lock without blocking.
    ///
    /// Returns `None` if another live owner holds it. Expired locks are
    /// stolen atomically.
    pub async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        let row: Option<(Uuid,)> = query_as(
            r#"
            INSERT INTO version_store.locks (lock_name, owner, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (lock_name) DO UPDATE SET
                owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE version_store.locks.expires_at <= NOW()
               OR version_store.locks.owner = EXCLUDED.owner
            RETURNING owner
            "#,
        )
        .bind(name)
        .bind(self.owner)
        .bind(self.ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((owner,)) if owner == self.owner => {
                debug!(lock = name, owner = %self.owner, "Lock acquired");
                Ok(Some(LockGuard {
                    pool: self.pool.clone(),
                    name: name.to_string(),
                    owner: self.owner,
                    released: false,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Blocks until the named lock is acquired or the timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::LockTimeout`] when the deadline passes.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire(name).await? {
                return Ok(guard);
            }
            if started.elapsed() + ACQUIRE_POLL_DELAY > timeout {
                return Err(VersioningError::LockTimeout {
                    name: name.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(ACQUIRE_POLL_DELAY).await;
        }
    }

    /// Acquires the lock, runs the operation, and releases on every exit
    /// path, including operation failure.
    ///
    /// The operation's error wins over a release error; a failed release is
    /// logged and left to expire via TTL.
    pub async fn with_lock<T, F, Fut>(&self, name: &str, timeout: Duration, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(name, timeout).await?;
        let result = op().await;
        if let Err(release_err) = guard.release().await {
            warn!(lock = name, error = %release_err, "Failed to release lock; it will expire via TTL");
        }
        result
    }
}

/// Proof of holding a named lock.
///
/// Release explicitly with [`LockGuard::release`]; an unreleased guard is
/// reclaimed by other owners only after its TTL expires.
#[derive(Debug)]
pub struct LockGuard {
    pool: PgPool,
    name: String,
    owner: Uuid,
    released: bool,
}

impl LockGuard {
    /// The lock's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the lock.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        query("DELETE FROM version_store.locks WHERE lock_name = $1 AND owner = $2")
            .bind(&self.name)
            .bind(self.owner)
            .execute(&self.pool)
            .await?;
        debug!(lock = %self.name, "Lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                lock = %self.name,
                "LockGuard dropped without release; the lock will expire via TTL"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_naming_scheme() {
        assert_eq!(upgrade_lock_name(3), "UpgradeLock:3");
        assert_eq!(
            data_migration_lock_name("range-04"),
            "Lock:DataMigration:range-04"
        );
    }
}
