//! Embedded schema DDL for the version store.
//!
//! The statements are idempotent (`CREATE ... IF NOT EXISTS`) and applied
//! programmatically at setup time.

use sqlx_core::executor::Executor;
use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use crate::Result;

/// DDL for the version store: distributed locks, collection version records,
/// data-migration progress records, and the versioned document table.
pub const VERSION_STORE_SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS version_store;

CREATE TABLE IF NOT EXISTS version_store.locks (
    lock_name  TEXT        NOT NULL PRIMARY KEY,
    owner      UUID        NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS version_store.collection_versions (
    collection   TEXT        NOT NULL PRIMARY KEY,
    data_version INT         NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS version_store.data_migrations (
    id              TEXT        NOT NULL PRIMARY KEY,
    name            TEXT        NOT NULL,
    partition_range TEXT        NOT NULL,
    started         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed       TIMESTAMPTZ NULL,
    last_exception  TEXT        NULL
);

CREATE TABLE IF NOT EXISTS version_store.documents (
    partition_range TEXT  NOT NULL,
    id              TEXT  NOT NULL,
    data_version    INT   NOT NULL DEFAULT 0,
    etag            UUID  NOT NULL DEFAULT gen_random_uuid(),
    doc             JSONB NOT NULL,
    PRIMARY KEY (partition_range, id)
);
CREATE INDEX IF NOT EXISTS ix_documents_data_version
    ON version_store.documents (partition_range, data_version);
"#;

/// Applies the version-store schema.
#[instrument(skip(pool))]
pub async fn apply_version_store_schema(pool: &PgPool) -> Result<()> {
    pool.execute(VERSION_STORE_SCHEMA_SQL).await?;
    info!("Version store schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_covers_all_tables() {
        for table in ["locks", "collection_versions", "data_migrations", "documents"] {
            assert!(
                VERSION_STORE_SCHEMA_SQL.contains(&format!("version_store.{table}")),
                "missing DDL for version_store.{table}"
            );
        }
    }

    #[test]
    fn test_ddl_is_idempotent() {
        for stmt in VERSION_STORE_SCHEMA_SQL.split("CREATE TABLE").skip(1) {
            assert!(stmt.trim_start().starts_with("IF NOT EXISTS"));
        }
        for stmt in VERSION_STORE_SCHEMA_SQL.split("CREATE INDEX").skip(1) {
            assert!(stmt.trim_start().starts_with("IF NOT EXISTS"));
        }
    }
}
