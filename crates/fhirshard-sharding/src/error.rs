//! Error taxonomy and transient-error classification for the sharding engine.
//!
//! The retry layers never match on error message text: transient conditions
//! are an explicit allow-list of PostgreSQL SQLSTATE codes plus the sqlx error
//! kinds that indicate a transport or pool problem.

use fhirshard_core::ShardId;
use sqlx_core::error::Error as SqlxError;

/// PostgreSQL SQLSTATE codes classified as transient.
///
/// Connection exceptions (class 08), resource pressure (53300/53400), server
/// restart/failover signals (57P01..57P03), and retryable transaction
/// failures (40001/40P01). Anything outside this list is treated as fatal.
pub const TRANSIENT_PG_CODES: &[&str] = &[
    "08000", // connection_exception
    "08001", // sqlclient_unable_to_establish_sqlconnection
    "08003", // connection_does_not_exist
    "08006", // connection_failure
    "53300", // too_many_connections
    "53400", // configuration_limit_exceeded
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

/// Checks whether a SQLSTATE code is in the transient allow-list.
#[must_use]
pub fn is_transient_code(code: &str) -> bool {
    TRANSIENT_PG_CODES.contains(&code)
}

/// Classifies a sqlx error as transient (worth retrying) or fatal.
#[must_use]
pub fn is_transient(err: &SqlxError) -> bool {
    match err {
        SqlxError::Io(_) | SqlxError::Tls(_) | SqlxError::PoolTimedOut => true,
        SqlxError::Database(db_err) => db_err
            .code()
            .as_deref()
            .is_some_and(is_transient_code),
        _ => false,
    }
}

/// Errors produced by the sharding storage engine.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// The central metadata store returned no shardlets for the requested
    /// topology version. Fatal: the process cannot route anything.
    #[error("No shardlets found for topology version {version:?}")]
    NoShardlets {
        /// Requested topology version, `None` meaning latest.
        version: Option<i32>,
    },

    /// The topology does not cover every shard it references. Fatal.
    #[error("Incomplete shard topology: {message}")]
    IncompleteTopology {
        /// Which invariant was violated.
        message: String,
    },

    /// A shardlet appeared on a routed row but is absent from the map.
    #[error("Shardlet {0} is not present in the topology map")]
    UnknownShardlet(fhirshard_core::ShardletId),

    /// A shard id is not part of the topology this service was built with.
    #[error("Shard {0} is not present in the topology map")]
    UnknownShard(ShardId),

    /// A spawned per-shard task failed to complete (panic or abort).
    #[error("Shard task failed: {message}")]
    Task { message: String },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Connection(#[from] SqlxError),

    /// A per-shard merge failed; other shards are not rolled back.
    #[error("Merge failed on shard {shard_id}: {source}")]
    Merge {
        /// The shard whose merge statement failed.
        shard_id: ShardId,
        /// The underlying database error.
        #[source]
        source: SqlxError,
    },

    /// The retry window elapsed without a successful attempt.
    #[error("Operation did not succeed within the {seconds}s retry window")]
    RetryTimeout {
        /// Length of the rolling retry window.
        seconds: u64,
    },

    /// A command exceeded its per-call timeout.
    #[error("Command timed out after {seconds}s")]
    CommandTimeout {
        /// The per-call command timeout.
        seconds: u64,
    },

    /// The operation was cancelled before dispatch.
    #[error("Operation cancelled")]
    Canceled,

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl ShardError {
    /// Creates a new incomplete-topology error.
    #[must_use]
    pub fn incomplete_topology(message: impl Into<String>) -> Self {
        Self::IncompleteTopology {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wraps a per-shard merge failure.
    #[must_use]
    pub fn merge(shard_id: ShardId, source: SqlxError) -> Self {
        Self::Merge { shard_id, source }
    }

    /// Returns `true` if the underlying condition is worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(e) => is_transient(e),
            Self::Merge { source, .. } => is_transient(source),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_code_allow_list() {
        assert!(is_transient_code("57P01"));
        assert!(is_transient_code("08006"));
        assert!(is_transient_code("40001"));
        // Undefined table and unique violation are programming/data errors.
        assert!(!is_transient_code("42P01"));
        assert!(!is_transient_code("23505"));
    }

    #[test]
    fn test_sqlx_error_kinds() {
        let io = SqlxError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(is_transient(&io));
        assert!(is_transient(&SqlxError::PoolTimedOut));
        assert!(!is_transient(&SqlxError::RowNotFound));
    }

    #[test]
    fn test_error_display() {
        let err = ShardError::NoShardlets { version: Some(3) };
        assert!(err.to_string().contains("No shardlets"));

        let err = ShardError::incomplete_topology("shard 2 has no shardlets");
        assert!(err.to_string().contains("shard 2 has no shardlets"));

        let err = ShardError::RetryTimeout { seconds: 600 };
        assert!(err.to_string().contains("600"));
    }

    #[test]
    fn test_is_transient_on_wrapped_errors() {
        let err = ShardError::Connection(SqlxError::PoolTimedOut);
        assert!(err.is_transient());

        let err = ShardError::Canceled;
        assert!(!err.is_transient());
    }
}
