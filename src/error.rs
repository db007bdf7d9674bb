//! Error types for the leaderboard index.

use thiserror::Error;

/// Result type alias for leaderboard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the leaderboard index.
///
/// A missing user is never an error (see [`crate::Rank::NotRanked`]) and a
/// high-score policy rejection is reported through
/// [`crate::AddOutcome::Rejected`]. What remains here are failures the caller
/// of a read or write has to see.
#[derive(Error, Debug)]
pub enum Error {
    /// Backing store errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled (maintenance shutdown).
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Migration checkpoint could not be read or written.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short label used for the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Store(StoreError::Unavailable(_)) => "store_unavailable",
            Error::Store(StoreError::Timeout) => "store_timeout",
            Error::Store(StoreError::SchemaMissing) => "schema_missing",
            Error::Store(_) => "store",
            Error::Config(_) => "config",
            Error::Cancelled => "cancelled",
            Error::Timeout => "timeout",
            Error::Checkpoint(_) => "checkpoint",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Store(StoreError::Unavailable(_)) | Error::Store(StoreError::Timeout) | Error::Timeout
        )
    }
}

/// Backing store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time.
    #[error("store request timed out")]
    Timeout,

    /// Tables have not been created yet.
    #[error("schema missing")]
    SchemaMissing,

    /// A paging token or record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("store io error: {0}")]
    Io(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Store(StoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts() {
        let err: Error = StoreError::Timeout.into();
        assert!(matches!(err, Error::Store(StoreError::Timeout)));
        assert_eq!(err.kind(), "store_timeout");
        assert!(err.is_transient());
    }

    #[test]
    fn test_non_transient() {
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Store(StoreError::SchemaMissing).is_transient());
        assert_eq!(Error::Config("x".into()).to_string(), "config error: x");
    }
}
