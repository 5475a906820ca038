//! Error types used across the Cellbox runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for Cellbox operations.
pub type CellboxResult<T> = Result<T, CellboxError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CellboxError {
    #[error("internal error: {0}")]
    Internal(String),

    /// Box not found in the registry.
    #[error("box not found: {0}")]
    NotFound(String),

    /// Box or resource already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Box is in wrong state for the requested operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("images error: {0}")]
    Image(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("execution error: {0}")]
    Execution(String),

    /// Execution was cut short because its box was stopped.
    #[error("stopped: {0}")]
    Stopped(String),

    #[error("engine reported an error: {0}")]
    Engine(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("database error: {0}")]
    Database(String),

    /// Metadata corruption or parsing error.
    #[error("metadata error: {0}")]
    Metadata(String),
}

/// Stable numeric code for each error kind.
///
/// Values are part of the boundary contract and must not be renumbered.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok = 0,
    Internal = 1,
    NotFound = 2,
    AlreadyExists = 3,
    InvalidState = 4,
    InvalidArgument = 5,
    Config = 6,
    Storage = 7,
    Image = 8,
    Network = 9,
    Execution = 10,
    Stopped = 11,
    Engine = 12,
    Unsupported = 13,
    Database = 14,
    Metadata = 15,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl CellboxError {
    /// Discriminated kind of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CellboxError::Internal(_) => ErrorCode::Internal,
            CellboxError::NotFound(_) => ErrorCode::NotFound,
            CellboxError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            CellboxError::InvalidState(_) => ErrorCode::InvalidState,
            CellboxError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            CellboxError::Config(_) => ErrorCode::Config,
            CellboxError::Storage(_) => ErrorCode::Storage,
            CellboxError::Image(_) => ErrorCode::Image,
            CellboxError::Network(_) => ErrorCode::Network,
            CellboxError::Execution(_) => ErrorCode::Execution,
            CellboxError::Stopped(_) => ErrorCode::Stopped,
            CellboxError::Engine(_) => ErrorCode::Engine,
            CellboxError::Unsupported(_) => ErrorCode::Unsupported,
            CellboxError::Database(_) => ErrorCode::Database,
            CellboxError::Metadata(_) => ErrorCode::Metadata,
        }
    }

    /// Human-readable detail without the kind prefix.
    pub fn detail(&self) -> &str {
        match self {
            CellboxError::Internal(s)
            | CellboxError::NotFound(s)
            | CellboxError::AlreadyExists(s)
            | CellboxError::InvalidState(s)
            | CellboxError::InvalidArgument(s)
            | CellboxError::Config(s)
            | CellboxError::Storage(s)
            | CellboxError::Image(s)
            | CellboxError::Network(s)
            | CellboxError::Execution(s)
            | CellboxError::Stopped(s)
            | CellboxError::Engine(s)
            | CellboxError::Unsupported(s)
            | CellboxError::Database(s)
            | CellboxError::Metadata(s) => s,
        }
    }
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for CellboxError {
    fn from(err: std::io::Error) -> Self {
        CellboxError::Internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for CellboxError {
    fn from(err: serde_json::Error) -> Self {
        CellboxError::InvalidArgument(format!("JSON error: {}", err))
    }
}
