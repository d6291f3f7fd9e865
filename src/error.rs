//! Error types for the session transaction-state cache

use crate::session::ReadConcernLevel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Stable error codes, one per error kind
///
/// Used where an error has to be named without being raised, e.g. the code a
/// fail point should inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ConflictingOperationInProgress,
    TransactionTooOld,
    WriteConflict,
    NamespaceNotFound,
    UnsupportedReadConcern,
    IncompleteTransactionHistory,
    Io,
    Serialization,
    Corruption,
    InvalidArgument,
    InternalError,
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// Cache is invalid or a different transaction is active; retry after a refresh
    #[error("Conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    #[error("Transaction too old: {0}")]
    TransactionTooOld(String),

    #[error("Write conflict")]
    WriteConflict,

    /// The persisted session table is gone. Not retryable.
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Unsupported read concern: {0:?}")]
    UnsupportedReadConcern(ReadConcernLevel),

    #[error("Incomplete transaction history: {0}")]
    IncompleteTransactionHistory(String),

    #[error("Fail point triggered ({code:?}): {message}")]
    FailPointTriggered { code: ErrorCode, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConflictingOperationInProgress(_) => ErrorCode::ConflictingOperationInProgress,
            Self::TransactionTooOld(_) => ErrorCode::TransactionTooOld,
            Self::WriteConflict => ErrorCode::WriteConflict,
            Self::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            Self::UnsupportedReadConcern(_) => ErrorCode::UnsupportedReadConcern,
            Self::IncompleteTransactionHistory(_) => ErrorCode::IncompleteTransactionHistory,
            Self::FailPointTriggered { code, .. } => *code,
            Self::Io(_) => ErrorCode::Io,
            Self::Serialization(_) => ErrorCode::Serialization,
            Self::Corruption(_) => ErrorCode::Corruption,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
        }
    }

    /// Whether the caller may restart the whole logical operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::WriteConflict | ErrorCode::ConflictingOperationInProgress
        )
    }

    pub fn is_write_conflict(&self) -> bool {
        self.code() == ErrorCode::WriteConflict
    }

    /// Operational errors outside normal program logic; reported, never retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NamespaceNotFound(_))
    }
}

impl From<bincode::Error> for SessionError {
    fn from(err: bincode::Error) -> Self {
        SessionError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Serialization(err.to_string())
    }
}
