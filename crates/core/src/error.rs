//! Unified error types for sqlcache.
//!
//! The set is closed: I/O-class, transaction-class, schema-class,
//! data-integrity ("corruption signals"), request-semantics, and a few
//! operational states.

use tokio_rusqlite::rusqlite;

/// Unified error type for every store, shard, and engine operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cache directory could not be created.
    #[error("FAILED_TO_CREATE_DIRECTORY: {0}")]
    FailedToCreateDirectory(String),

    /// The shard database file could not be opened.
    #[error("FAILED_TO_OPEN_DATABASE: {0}")]
    FailedToOpenDatabase(String),

    /// An incompatible database was found and could not be razed.
    #[error("FAILED_TO_RAZE_INCOMPATIBLE_DATABASE")]
    FailedToRazeIncompatibleDatabase,

    /// `BEGIN` failed.
    #[error("FAILED_TO_START_TRANSACTION")]
    FailedToStartTransaction,

    /// `COMMIT` failed.
    #[error("FAILED_TO_COMMIT_TRANSACTION")]
    FailedToCommitTransaction,

    /// A statement failed while running.
    #[error("FAILED_TO_EXECUTE: {0}")]
    Database(tokio_rusqlite::Error),

    /// The meta table could not be created or read.
    #[error("FAILED_TO_INITIALIZE_META_TABLE")]
    FailedToInitializeMetaTable,

    /// The schema could not be created or migrated.
    #[error("FAILED_TO_INITIALIZE_SCHEMA: {0}")]
    FailedToInitializeSchema(String),

    /// Stored data is internally inconsistent.
    #[error("INVALID_DATA: {0}")]
    InvalidData(String),

    /// A header or blob checksum did not match its payload.
    #[error("CHECKSUM_ERROR")]
    ChecksumError,

    /// The body end stored in the database did not match the expected value.
    #[error("BODY_END_MISMATCH: expected {expected}, stored {stored}")]
    BodyEndMismatch { expected: i64, stored: i64 },

    /// No matching entry.
    #[error("NOT_FOUND")]
    NotFound,

    /// A live entry already exists for the key.
    #[error("ALREADY_EXISTS")]
    AlreadyExists,

    /// A request argument is out of range.
    #[error("INVALID_ARGUMENT: {0}")]
    InvalidArgument(String),

    /// The engine or shard has not been initialized yet.
    #[error("NOT_INITIALIZED")]
    NotInitialized,

    /// The shard database was closed after a catastrophic failure.
    #[error("DATABASE_CLOSED")]
    DatabaseClosed,

    /// Idle-time eviction stopped because the process stopped being idle.
    #[error("ABORTED_DUE_TO_BROWSER_ACTIVITY")]
    AbortedDueToBrowserActivity,
}

impl Error {
    /// True for the data-integrity class ("corruption signals").
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::InvalidData(_) | Error::ChecksumError | Error::BodyEndMismatch { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// True when SQLite reports a failure the shard cannot recover from in place.
    ///
    /// A full disk is treated the same way: for a cache, freeing the space is
    /// the only useful reaction.
    pub fn is_catastrophic(&self) -> bool {
        let Error::Database(tokio_rusqlite::Error::Error(err)) = self else {
            return false;
        };
        matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DiskFull)
        )
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::DatabaseClosed,
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::DatabaseClosed,
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        match err {
            tokio_rusqlite::Error::ConnectionClosed => Error::DatabaseClosed,
            other => Error::Database(other),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::BodyEndMismatch { expected: 10, stored: 12 };
        assert!(err.to_string().contains("BODY_END_MISMATCH"));
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn test_corruption_class() {
        assert!(Error::ChecksumError.is_corruption());
        assert!(Error::InvalidData("x".into()).is_corruption());
        assert!(Error::BodyEndMismatch { expected: 0, stored: 1 }.is_corruption());
        assert!(!Error::NotFound.is_corruption());
        assert!(!Error::AlreadyExists.is_corruption());
    }

    #[test]
    fn test_catastrophic_detection() {
        let corrupt = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            Some("database disk image is malformed".into()),
        );
        assert!(Error::from(corrupt).is_catastrophic());

        let busy = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None);
        assert!(!Error::from(busy).is_catastrophic());
        assert!(!Error::NotFound.is_catastrophic());
    }

    #[test]
    fn test_connection_closed_maps_to_database_closed() {
        let err: Error = tokio_rusqlite::Error::<Error>::ConnectionClosed.into();
        assert!(matches!(err, Error::DatabaseClosed));
    }
}
