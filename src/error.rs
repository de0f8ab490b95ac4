use rusqlite::ErrorCode as SqliteErrorCode;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    Sql,
    Io,
    InvalidConfig,
    InvalidOrigin,
    Closed,
    Encoding,
    WorkerStopped,
}

impl StorageErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageErrorCode::Sql => "sql",
            StorageErrorCode::Io => "io",
            StorageErrorCode::InvalidConfig => "invalid_config",
            StorageErrorCode::InvalidOrigin => "invalid_origin",
            StorageErrorCode::Closed => "closed",
            StorageErrorCode::Encoding => "encoding",
            StorageErrorCode::WorkerStopped => "worker_stopped",
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("invalid origin '{input}': {reason}")]
    InvalidOrigin { input: String, reason: String },
    #[error("database is closed")]
    Closed,
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("storage worker stopped")]
    WorkerStopped,
}

impl StorageError {
    pub fn code(&self) -> StorageErrorCode {
        match self {
            StorageError::Sql(_) => StorageErrorCode::Sql,
            StorageError::Io(_) => StorageErrorCode::Io,
            StorageError::InvalidConfig { .. } => StorageErrorCode::InvalidConfig,
            StorageError::InvalidOrigin { .. } => StorageErrorCode::InvalidOrigin,
            StorageError::Closed => StorageErrorCode::Closed,
            StorageError::Encoding(_) => StorageErrorCode::Encoding,
            StorageError::WorkerStopped => StorageErrorCode::WorkerStopped,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Whether the underlying file can no longer be trusted. Such errors are
    /// answered by razing the store so that the next call starts from scratch.
    pub fn is_catastrophic(&self) -> bool {
        match self {
            StorageError::Sql(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                SqliteErrorCode::DatabaseCorrupt | SqliteErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::{StorageError, StorageErrorCode};

    fn sqlite_failure(code: i32) -> StorageError {
        StorageError::Sql(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(StorageErrorCode::Sql.as_str(), "sql");
        assert_eq!(StorageErrorCode::InvalidConfig.as_str(), "invalid_config");
        assert_eq!(StorageErrorCode::WorkerStopped.as_str(), "worker_stopped");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = StorageError::InvalidOrigin {
            input: "data:,".into(),
            reason: "opaque origin".into(),
        };
        assert_eq!(err.code(), StorageErrorCode::InvalidOrigin);
        assert_eq!(err.code_str(), "invalid_origin");
    }

    #[test]
    fn corruption_is_catastrophic_but_busy_is_not() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_CORRUPT).is_catastrophic());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_NOTADB).is_catastrophic());
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_BUSY).is_catastrophic());
        assert!(!StorageError::Closed.is_catastrophic());
    }
}
