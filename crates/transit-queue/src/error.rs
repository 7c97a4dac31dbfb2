/// Errors returned by the retry queue.
///
/// Only store failures surface here. Business outcomes (denied, dangling
/// reference, unreachable peer) are decided by callers and expressed as
/// `commit` or `cancel`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("queue lock poisoned")]
    LockPoisoned,

    #[error("invalid queue key: {reason}")]
    InvalidKey { reason: String },

    #[error("corrupted queue row: {reason}")]
    Corrupted { reason: String },
}

impl<T> From<std::sync::PoisonError<T>> for QueueError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        QueueError::LockPoisoned
    }
}
