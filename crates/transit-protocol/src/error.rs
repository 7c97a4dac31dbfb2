/// Protocol-level errors for transit delivery.
///
/// Wraps queue, storage and transport failures and adds the protocol's own
/// variants (bad envelopes, missing files, codec errors).
use crate::types::{DriveId, FileId, FileRef, VersionTag};

/// Errors reported by a [`DriveStorage`](crate::storage::DriveStorage).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("version conflict: expected {expected}, stored {actual:?}")]
    VersionConflict {
        expected: VersionTag,
        actual: Option<VersionTag>,
    },

    #[error("file not found: {drive}/{file}")]
    NotFound { drive: DriveId, file: FileId },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Worth retrying later: the same write may succeed against fresh state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::VersionConflict { .. } | StorageError::Unavailable(_)
        )
    }
}

/// Errors reported by a [`PeerTransport`](crate::transport::PeerTransport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer unreachable: {identity}")]
    Unreachable { identity: String },

    #[error("transport protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransitError {
    #[error("queue error: {0}")]
    Queue(#[from] transit_queue::QueueError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("file not found: {0}")]
    FileNotFound(FileRef),

    #[error("file {0} has no global transit id")]
    MissingGlobalTransitId(FileRef),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<rmp_serde::encode::Error> for TransitError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TransitError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransitError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TransitError::Deserialization(e.to_string())
    }
}
