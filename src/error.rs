use rusqlite::ErrorCode;

pub type Result<T> = std::result::Result<T, SentinelError>;

#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("Missing template variable: {0}")]
    MissingVariable(String),
    #[error("Storage error: {message}")]
    Storage { message: String, transient: bool },
    #[error("Concurrency error: {0}")]
    Concurrency(String),
    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Structural problems found by `PolicyStore::verify_integrity`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntegrityError {
    #[error("SQLite integrity check reported: {0}")]
    Corrupted(String),
    #[error("Missing table: {0}")]
    MissingTable(String),
    #[error("Schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: i64, supported: i64 },
    #[error("Row {id} in {table} holds invalid data: {reason}")]
    InvalidRow {
        table: &'static str,
        id: i64,
        reason: String,
    },
    #[error("Store could not be checked: {0}")]
    Unverifiable(String),
}

impl SentinelError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// Errors that warrant another attempt by the retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Concurrency(_) | Self::Storage { transient: true, .. }
        )
    }

    /// Errors that put the store into fail-safe mode once retries are exhausted.
    pub fn degrades_store(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Integrity(_))
    }
}

impl From<rusqlite::Error> for SentinelError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(ffi, _) => match ffi.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Self::Concurrency(err.to_string())
                }
                ErrorCode::SystemIoFailure => Self::Storage {
                    message: err.to_string(),
                    transient: true,
                },
                ErrorCode::ConstraintViolation => Self::ConstraintViolation(err.to_string()),
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    Self::Integrity(IntegrityError::Corrupted(err.to_string()))
                }
                _ => Self::storage(err.to_string()),
            },
            _ => Self::storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_concurrency() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let mapped = SentinelError::from(err);
        assert!(matches!(mapped, SentinelError::Concurrency(_)));
        assert!(mapped.is_retryable());
        assert!(!mapped.degrades_store());
    }

    #[test]
    fn test_io_failure_is_transient_storage() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
            None,
        );
        let mapped = SentinelError::from(err);
        assert!(matches!(
            mapped,
            SentinelError::Storage {
                transient: true,
                ..
            }
        ));
        assert!(mapped.degrades_store());
    }

    #[test]
    fn test_validation_is_final() {
        let err = SentinelError::Validation("bad".to_string());
        assert!(!err.is_retryable());
        assert!(!err.degrades_store());
    }
}
