//! Error types for the versioning and migration subsystem.

use std::time::Duration;

use sqlx_core::error::Error as SqlxError;

/// PostgreSQL SQLSTATE codes treated as resource-pressure throttling.
const THROTTLING_PG_CODES: &[&str] = &[
    "53300", // too_many_connections
    "53400", // configuration_limit_exceeded
];

/// Default backoff hint when the database throttles a request.
pub(crate) const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Errors produced by locking, upgrades, and data migrations.
#[derive(Debug, thiserror::Error)]
pub enum VersioningError {
    /// A blocking lock acquisition ran out of time.
    #[error("Timed out acquiring lock {name:?} after {waited_secs}s")]
    LockTimeout {
        /// The lock that could not be acquired.
        name: String,
        /// How long acquisition waited.
        waited_secs: u64,
    },

    /// The persisted data version is newer than this build supports.
    ///
    /// Signals a rollback/downgrade scenario: the service must refuse to run
    /// against the collection rather than attempt destructive schema work.
    #[error(
        "Persisted data version {persisted} is newer than supported version {supported}; refusing to run"
    )]
    VersionTooNew {
        /// The version found in the collection-version record.
        persisted: i32,
        /// The highest version this build knows how to handle.
        supported: i32,
    },

    /// The storage layer asked us to back off.
    #[error("Throttled by storage; retry after {retry_after:?}")]
    Throttled {
        /// Suggested wait before retrying.
        retry_after: Duration,
    },

    /// A document failed one of its migration steps.
    #[error("Migration {name} failed on document {document_id}: {message}")]
    DocumentFailed {
        /// The migration that failed.
        name: String,
        /// The document it failed on.
        document_id: String,
        /// Why it failed.
        message: String,
    },

    /// Database error.
    #[error("Database error: {0}")]
    Storage(SqlxError),

    /// Document (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<SqlxError> for VersioningError {
    /// Maps resource-pressure SQLSTATEs to [`VersioningError::Throttled`] so
    /// callers can apply the doubled-retry-after backoff; everything else is
    /// a plain storage error.
    fn from(err: SqlxError) -> Self {
        if let SqlxError::Database(db_err) = &err
            && db_err
                .code()
                .as_deref()
                .is_some_and(|code| THROTTLING_PG_CODES.contains(&code))
        {
            return Self::Throttled {
                retry_after: DEFAULT_RETRY_AFTER,
            };
        }
        Self::Storage(err)
    }
}

impl VersioningError {
    /// Creates a per-document failure record.
    #[must_use]
    pub fn document_failed(
        name: impl Into<String>,
        document_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::DocumentFailed {
            name: name.into(),
            document_id: document_id.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for versioning operations.
pub type Result<T> = std::result::Result<T, VersioningError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VersioningError::LockTimeout {
            name: "UpgradeLock:3".into(),
            waited_secs: 30,
        };
        assert!(err.to_string().contains("UpgradeLock:3"));

        let err = VersioningError::VersionTooNew {
            persisted: 5,
            supported: 3,
        };
        assert!(err.to_string().contains("refusing to run"));
    }

    #[test]
    fn test_non_database_sqlx_error_is_storage() {
        let err: VersioningError = SqlxError::RowNotFound.into();
        assert!(matches!(err, VersioningError::Storage(_)));
    }
}
