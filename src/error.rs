//! Error types for batonio.

use std::path::PathBuf;

use thiserror::Error;

use crate::envelope::Operation;

/// iRODS error code reported when a collection or data object does not
/// exist.
pub const RODS_USER_FILE_DOES_NOT_EXIST: i32 = -310000;

/// iRODS error code reported when removing a collection that still has
/// contents, without recursion.
pub const RODS_CAT_COLLECTION_NOT_EMPTY: i32 = -821000;

/// An error raised on the iRODS server and reported in-band by baton-do.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} code: {code}")]
pub struct RodsError {
    /// Message reported by the server.
    pub message: String,
    /// Signed 32-bit iRODS error code.
    pub code: i32,
}

impl RodsError {
    /// The iRODS error code.
    pub fn code(&self) -> i32 {
        self.code
    }
}

/// Main error type for batonio.
#[derive(Error, Debug)]
pub enum BatonError {
    #[error("baton-do not present in PATH '{0}'")]
    NotOnSearchPath(String),

    #[error("'{}' is not an executable file", .0.display())]
    NotExecutable(PathBuf),

    #[error("client is already running")]
    AlreadyRunning,

    #[error("client is not running")]
    NotRunning,

    #[error("item is not attached to a running client")]
    Detached,

    #[error("failed to spawn baton-do: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("receiving from baton-do failed")]
    ReceiveFailed,

    #[error("baton-do terminated abnormally: {0}")]
    Exited(String),

    #[error("invalid {operation} envelope: {reason}")]
    MalformedEnvelope {
        operation: Operation,
        reason: String,
    },

    #[error("{operation} operation failed: {source}")]
    Rods {
        operation: Operation,
        #[source]
        source: RodsError,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no such item: {0}")]
    NotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the client pool is closed")]
    PoolClosed,

    #[error("timeout getting a client from the pool")]
    PoolTimeout,

    #[error("failed to get a client from the pool after {tries} tries")]
    PoolExhausted { tries: u8 },
}

impl BatonError {
    /// Returns true if this error wraps an error raised on the iRODS
    /// server.
    pub fn is_rods_error(&self) -> bool {
        matches!(self, BatonError::Rods { .. })
    }

    /// The iRODS error code, if this error wraps a server error.
    pub fn rods_error_code(&self) -> Option<i32> {
        match self {
            BatonError::Rods { source, .. } => Some(source.code),
            _ => None,
        }
    }
}

/// Returns true if the error wraps an error raised on the iRODS server.
pub fn is_rods_error(err: &BatonError) -> bool {
    err.is_rods_error()
}

/// Returns the iRODS error code of a server error, or `None` for any
/// other kind of error.
pub fn rods_error_code(err: &BatonError) -> Option<i32> {
    err.rods_error_code()
}

/// Result type alias for batonio operations.
pub type Result<T> = std::result::Result<T, BatonError>;
