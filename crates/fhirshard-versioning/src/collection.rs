//! Collection version records and the upgrade manager.
//!
//! A collection has one singleton `CollectionVersion` row recording the data
//! version its documents and indexes conform to. Upgrades run a statically
//! ordered list of idempotent updaters under the `"UpgradeLock:{version}"`
//! distributed lock, so concurrent service instances race safely: one does
//! the work, the rest find nothing left to do.

use std::time::Duration;

use async_trait::async_trait;
use sqlx_core::executor::Executor;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use time::OffsetDateTime;
use tracing::{info, instrument};

use crate::error::{Result, VersioningError};
use crate::lock::{DistributedLock, upgrade_lock_name};

/// The singleton version record of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionVersion {
    /// Collection identifier (URI or name).
    pub collection: String,
    /// Data version the collection currently conforms to.
    pub data_version: i32,
    /// When the version was last changed.
    pub updated_at: OffsetDateTime,
}

/// Fails fast when the persisted data version is newer than this build.
///
/// A newer persisted version means the service was downgraded against data
/// written by a later release; running updaters against it could be
/// destructive, so the caller must refuse to start instead.
///
/// # Errors
///
/// Returns [`VersioningError::VersionTooNew`] when `persisted > supported`.
pub fn ensure_version_supported(persisted: i32, supported: i32) -> Result<()> {
    if persisted > supported {
        return Err(VersioningError::VersionTooNew {
            persisted,
            supported,
        });
    }
    Ok(())
}

/// Fetches a collection's full version record, if one exists.
pub async fn fetch_collection_version(
    pool: &PgPool,
    collection: &str,
) -> Result<Option<CollectionVersion>> {
    let row: Option<(String, i32, OffsetDateTime)> = query_as(
        r#"
        SELECT collection, data_version, updated_at
        FROM version_store.collection_versions
        WHERE collection = $1
        "#,
    )
    .bind(collection)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(collection, data_version, updated_at)| CollectionVersion {
        collection,
        data_version,
        updated_at,
    }))
}

/// Reads a collection's persisted data version; 0 when no record exists yet.
pub async fn read_collection_version(pool: &PgPool, collection: &str) -> Result<i32> {
    let row: Option<(i32,)> = query_as(
        "SELECT data_version FROM version_store.collection_versions WHERE collection = $1",
    )
    .bind(collection)
    .fetch_optional(pool)
    .await?;
    Ok(row.map_or(0, |(v,)| v))
}

async fn write_collection_version(pool: &PgPool, collection: &str, version: i32) -> Result<()> {
    query(
        r#"
        INSERT INTO version_store.collection_versions (collection, data_version, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (collection) DO UPDATE SET
            data_version = EXCLUDED.data_version,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(collection)
    .bind(version)
    .execute(pool)
    .await?;
    Ok(())
}

/// One idempotent step of a collection upgrade.
///
/// Implementations read the persisted version themselves if they need finer
/// judgement; the manager only invokes an updater when the persisted version
/// is below its target.
#[async_trait]
pub trait CollectionUpdater: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Version the collection is at once this updater has run.
    fn target_version(&self) -> i32;

    /// Applies the change. Must be idempotent.
    async fn execute(&self, pool: &PgPool, collection: &str) -> Result<()>;
}

/// Bumps the persisted data version after validating compatibility.
#[derive(Debug)]
pub struct SettingsUpdater {
    target_version: i32,
}

impl SettingsUpdater {
    /// Creates an updater targeting the given data version.
    #[must_use]
    pub fn new(target_version: i32) -> Self {
        Self { target_version }
    }
}

#[async_trait]
impl CollectionUpdater for SettingsUpdater {
    fn name(&self) -> &str {
        "settings"
    }

    fn target_version(&self) -> i32 {
        self.target_version
    }

    async fn execute(&self, pool: &PgPool, collection: &str) -> Result<()> {
        let persisted = read_collection_version(pool, collection).await?;
        ensure_version_supported(persisted, self.target_version)?;
        if persisted < self.target_version {
            write_collection_version(pool, collection, self.target_version).await?;
            info!(
                collection,
                from = persisted,
                to = self.target_version,
                "Collection data version bumped"
            );
        }
        Ok(())
    }
}

/// Applies idempotent index DDL to the collection's document store.
#[derive(Debug)]
pub struct IndexUpdater {
    target_version: i32,
    statements: Vec<String>,
}

impl IndexUpdater {
    /// Creates an updater running the given `CREATE INDEX IF NOT EXISTS`
    /// statements.
    #[must_use]
    pub fn new(target_version: i32, statements: Vec<String>) -> Self {
        Self {
            target_version,
            statements,
        }
    }
}

#[async_trait]
impl CollectionUpdater for IndexUpdater {
    fn name(&self) -> &str {
        "indexes"
    }

    fn target_version(&self) -> i32 {
        self.target_version
    }

    async fn execute(&self, pool: &PgPool, _collection: &str) -> Result<()> {
        for statement in &self.statements {
            pool.execute(statement.as_str()).await?;
        }
        Ok(())
    }
}

/// Runs an ordered list of collection updaters under the upgrade lock.
pub struct UpgradeManager {
    pool: PgPool,
    collection: String,
    lock: DistributedLock,
    lock_timeout: Duration,
    data_version: i32,
    updaters: Vec<Box<dyn CollectionUpdater>>,
}

impl UpgradeManager {
    /// Creates a manager for one collection.
    ///
    /// `data_version` is the version this build upgrades to; the updater list
    /// runs in the order given.
    #[must_use]
    pub fn new(
        pool: PgPool,
        collection: impl Into<String>,
        lock: DistributedLock,
        lock_timeout: Duration,
        data_version: i32,
        updaters: Vec<Box<dyn CollectionUpdater>>,
    ) -> Self {
        Self {
            pool,
            collection: collection.into(),
            lock,
            lock_timeout,
            data_version,
            updaters,
        }
    }

    /// Acquires `"UpgradeLock:{version}"`, runs every updater whose target
    /// version exceeds the persisted version, and releases the lock on all
    /// exit paths.
    ///
    /// # Errors
    ///
    /// Fails fast with [`VersioningError::VersionTooNew`] when the persisted
    /// version is newer than this build, before any updater runs.
    #[instrument(skip(self), fields(collection = %self.collection, version = self.data_version))]
    pub async fn setup(&self) -> Result<()> {
        let lock_name = upgrade_lock_name(self.data_version);
        self.lock
            .with_lock(&lock_name, self.lock_timeout, || async {
                let persisted = read_collection_version(&self.pool, &self.collection).await?;
                ensure_version_supported(persisted, self.data_version)?;

                for updater in &self.updaters {
                    let persisted =
                        read_collection_version(&self.pool, &self.collection).await?;
                    if persisted >= updater.target_version() {
                        continue;
                    }
                    info!(
                        updater = updater.name(),
                        target = updater.target_version(),
                        "Running collection updater"
                    );
                    updater.execute(&self.pool, &self.collection).await?;
                }
                Ok(())
            })
            .await?;

        info!("Collection upgrade complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_downgrade_rejected() {
        let err = ensure_version_supported(5, 3).unwrap_err();
        assert!(matches!(
            err,
            VersioningError::VersionTooNew {
                persisted: 5,
                supported: 3
            }
        ));
    }

    #[test]
    fn test_version_at_or_below_supported_is_fine() {
        assert!(ensure_version_supported(3, 3).is_ok());
        assert!(ensure_version_supported(0, 3).is_ok());
    }

    #[test]
    fn test_settings_updater_metadata() {
        let updater = SettingsUpdater::new(4);
        assert_eq!(updater.name(), "settings");
        assert_eq!(updater.target_version(), 4);
    }
}
