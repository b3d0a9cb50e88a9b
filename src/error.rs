//! Error types for the sync service.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::sync::ReplicaId;

/// A client message that cannot be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

/// Failures of the durable snapshot store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Corrupt snapshot at {path}: {reason}")]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("Snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Snapshot write rejected: {0}")]
    WriteRejected(String),

    #[error("Snapshot save to {store} did not finish within {after:?}")]
    TimedOut { store: String, after: Duration },
}

/// Errors returned by the synchronization engine for a single message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Replica {0} is not connected")]
    UnknownReplica(ReplicaId),
}

pub type Result<T> = std::result::Result<T, SyncError>;
