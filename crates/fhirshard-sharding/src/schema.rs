//! Embedded schema DDL for the central metadata store and the shards.
//!
//! The statements are idempotent (`CREATE ... IF NOT EXISTS`) and applied
//! programmatically at setup time; no CLI or filesystem access is required.

use sqlx_core::executor::Executor;
use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use crate::Result;

/// DDL for the central metadata store: shard descriptors and shardlet
/// assignments, per topology version.
pub const CENTRAL_SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS shard_map;

CREATE TABLE IF NOT EXISTS shard_map.shards (
    topology_version  INT          NOT NULL,
    shard_id          SMALLINT     NOT NULL,
    connection_string TEXT         NOT NULL,
    shard_version     INT          NOT NULL DEFAULT 1,
    PRIMARY KEY (topology_version, shard_id)
);

CREATE TABLE IF NOT EXISTS shard_map.shardlets (
    topology_version  INT          NOT NULL,
    shardlet_id       SMALLINT     NOT NULL CHECK (shardlet_id BETWEEN 0 AND 2047),
    shard_id          SMALLINT     NOT NULL,
    PRIMARY KEY (topology_version, shardlet_id),
    FOREIGN KEY (topology_version, shard_id)
        REFERENCES shard_map.shards (topology_version, shard_id)
);
"#;

/// DDL for the transaction ledger, present on every database (shards and the
/// central store, which allocates cross-shard transaction ids).
pub const TRANSACTIONS_SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS shard;

CREATE TABLE IF NOT EXISTS shard.transactions (
    transaction_id BIGINT       NOT NULL GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
    definition     TEXT         NULL,
    status         TEXT         NOT NULL DEFAULT 'active',
    timeout_secs   INT          NULL,
    created_at     TIMESTAMPTZ  NOT NULL DEFAULT NOW(),
    heartbeat_at   TIMESTAMPTZ  NULL,
    committed_at   TIMESTAMPTZ  NULL,
    failure_reason TEXT         NULL,
    is_watchdog    BOOLEAN      NOT NULL DEFAULT FALSE
);
"#;

/// DDL for one shard: the resource table, the ten index tables, and the
/// transaction ledger. Index tables are keyed by the owning resource's
/// `(shardlet_id, sequence_id)` pair and replaced wholesale on merge.
pub const SHARD_SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS shard;

CREATE TABLE IF NOT EXISTS shard.resources (
    shardlet_id      SMALLINT NOT NULL,
    sequence_id      BIGINT   NOT NULL,
    resource_type_id SMALLINT NOT NULL,
    resource_id      TEXT     NOT NULL,
    version          INT      NOT NULL,
    is_deleted       BOOLEAN  NOT NULL DEFAULT FALSE,
    payload          BYTEA    NOT NULL,
    PRIMARY KEY (shardlet_id, sequence_id)
);

CREATE TABLE IF NOT EXISTS shard.reference_search_params (
    shardlet_id                 SMALLINT NOT NULL,
    sequence_id                 BIGINT   NOT NULL,
    search_param_id             SMALLINT NOT NULL,
    base_uri                    TEXT     NULL,
    referenced_resource_type_id SMALLINT NOT NULL,
    referenced_resource_id      TEXT     NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_reference_search_params_resource
    ON shard.reference_search_params (shardlet_id, sequence_id);

CREATE TABLE IF NOT EXISTS shard.token_search_params (
    shardlet_id     SMALLINT NOT NULL,
    sequence_id     BIGINT   NOT NULL,
    search_param_id SMALLINT NOT NULL,
    system_id       INT      NULL,
    code            TEXT     NULL
);
CREATE INDEX IF NOT EXISTS ix_token_search_params_resource
    ON shard.token_search_params (shardlet_id, sequence_id);

CREATE TABLE IF NOT EXISTS shard.compartment_assignments (
    shardlet_id            SMALLINT NOT NULL,
    sequence_id            BIGINT   NOT NULL,
    compartment_type_id    SMALLINT NOT NULL,
    referenced_resource_id TEXT     NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_compartment_assignments_resource
    ON shard.compartment_assignments (shardlet_id, sequence_id);

CREATE TABLE IF NOT EXISTS shard.token_texts (
    shardlet_id     SMALLINT NOT NULL,
    sequence_id     BIGINT   NOT NULL,
    search_param_id SMALLINT NOT NULL,
    text            TEXT     NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_token_texts_resource
    ON shard.token_texts (shardlet_id, sequence_id);

CREATE TABLE IF NOT EXISTS shard.date_time_search_params (
    shardlet_id          SMALLINT    NOT NULL,
    sequence_id          BIGINT      NOT NULL,
    search_param_id      SMALLINT    NOT NULL,
    start_time           TIMESTAMPTZ NOT NULL,
    end_time             TIMESTAMPTZ NOT NULL,
    is_longer_than_a_day BOOLEAN     NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_date_time_search_params_resource
    ON shard.date_time_search_params (shardlet_id, sequence_id);

CREATE TABLE IF NOT EXISTS shard.token_quantity_composite_search_params (
    shardlet_id        SMALLINT NOT NULL,
    sequence_id        BIGINT   NOT NULL,
    search_param_id    SMALLINT NOT NULL,
    system_id          INT      NULL,
    code               TEXT     NULL,
    quantity_system_id INT      NULL,
    quantity_code_id   INT      NULL,
    single_value       FLOAT8   NULL,
    low_value          FLOAT8   NULL,
    high_value         FLOAT8   NULL
);
CREATE INDEX IF NOT EXISTS ix_token_quantity_composite_search_params_resource
    ON shard.token_quantity_composite_search_params (shardlet_id, sequence_id);

CREATE TABLE IF NOT EXISTS shard.quantity_search_params (
    shardlet_id      SMALLINT NOT NULL,
    sequence_id      BIGINT   NOT NULL,
    search_param_id  SMALLINT NOT NULL,
    system_id        INT      NULL,
    quantity_code_id INT      NULL,
    single_value     FLOAT8   NULL,
    low_value        FLOAT8   NULL,
    high_value       FLOAT8   NULL
);
CREATE INDEX IF NOT EXISTS ix_quantity_search_params_resource
    ON shard.quantity_search_params (shardlet_id, sequence_id);

CREATE TABLE IF NOT EXISTS shard.string_search_params (
    shardlet_id     SMALLINT NOT NULL,
    sequence_id     BIGINT   NOT NULL,
    search_param_id SMALLINT NOT NULL,
    text            TEXT     NOT NULL,
    text_overflow   TEXT     NULL
);
CREATE INDEX IF NOT EXISTS ix_string_search_params_resource
    ON shard.string_search_params (shardlet_id, sequence_id);

CREATE TABLE IF NOT EXISTS shard.token_token_composite_search_params (
    shardlet_id     SMALLINT NOT NULL,
    sequence_id     BIGINT   NOT NULL,
    search_param_id SMALLINT NOT NULL,
    system_id1      INT      NULL,
    code1           TEXT     NULL,
    system_id2      INT      NULL,
    code2           TEXT     NULL
);
CREATE INDEX IF NOT EXISTS ix_token_token_composite_search_params_resource
    ON shard.token_token_composite_search_params (shardlet_id, sequence_id);

CREATE TABLE IF NOT EXISTS shard.token_string_composite_search_params (
    shardlet_id     SMALLINT NOT NULL,
    sequence_id     BIGINT   NOT NULL,
    search_param_id SMALLINT NOT NULL,
    system_id1      INT      NULL,
    code1           TEXT     NULL,
    text2           TEXT     NOT NULL,
    text_overflow2  TEXT     NULL
);
CREATE INDEX IF NOT EXISTS ix_token_string_composite_search_params_resource
    ON shard.token_string_composite_search_params (shardlet_id, sequence_id);
"#;

/// Applies the central metadata schema (plus the transaction ledger used for
/// cross-shard transaction-id allocation).
#[instrument(skip(pool))]
pub async fn apply_central_schema(pool: &PgPool) -> Result<()> {
    pool.execute(CENTRAL_SCHEMA_SQL).await?;
    pool.execute(TRANSACTIONS_SCHEMA_SQL).await?;
    info!("Central schema applied");
    Ok(())
}

/// Applies the per-shard schema: resource + index tables and the ledger.
#[instrument(skip(pool))]
pub async fn apply_shard_schema(pool: &PgPool) -> Result<()> {
    pool.execute(SHARD_SCHEMA_SQL).await?;
    pool.execute(TRANSACTIONS_SCHEMA_SQL).await?;
    info!("Shard schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_schema_covers_all_merge_tables() {
        for table in [
            "resources",
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
        ] {
            assert!(
                SHARD_SCHEMA_SQL.contains(&format!("shard.{table}")),
                "missing DDL for shard.{table}"
            );
        }
    }

    #[test]
    fn test_ddl_is_idempotent() {
        for sql in [CENTRAL_SCHEMA_SQL, TRANSACTIONS_SCHEMA_SQL, SHARD_SCHEMA_SQL] {
            for stmt in sql.split("CREATE TABLE").skip(1) {
                assert!(stmt.trim_start().starts_with("IF NOT EXISTS"));
            }
            for stmt in sql.split("CREATE INDEX").skip(1) {
                assert!(stmt.trim_start().starts_with("IF NOT EXISTS"));
            }
        }
    }
}
