//! Error taxonomy for the synchronization layer.
//!
//! Errors never cross the public boundary of the cache or the controllers; they
//! are logged, recorded on the controller state, or turned into a boolean. They
//! exist so the internals can use `?` and the adapters can say *why* something
//! degraded.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The durable local store failed or is unavailable.
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The remote service could not be reached.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The remote service answered with a non-2xx status.
    #[error("Remote rejected request with status {status}")]
    RemoteRejected { status: u16 },

    /// The remote answered 2xx but reported `success: false`.
    #[error("Remote reported failure: {0}")]
    RemoteUnsuccessful(String),

    /// A remote call was suppressed because the monitor reports offline.
    #[error("Offline: remote calls are suspended")]
    Offline,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<lmdb::Error> for SyncError {
    fn from(err: lmdb::Error) -> Self {
        match err {
            lmdb::Error::MapFull => {
                SyncError::DatabaseError("Storage quota exceeded (map full)".to_string())
            }
            lmdb::Error::Corrupted => {
                SyncError::DatabaseError("Database is corrupted".to_string())
            }
            other => SyncError::DatabaseError(format!("{other:?}")),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => SyncError::RemoteRejected {
                status: status.as_u16(),
            },
            None => SyncError::NetworkError(err.to_string()),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
