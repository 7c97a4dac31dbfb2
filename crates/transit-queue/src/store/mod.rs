/// Queue stores: where items live between `upsert` and `commit`.
///
/// A store is shared by every logical queue built on it; each call names
/// the queue it operates on. All mutations are atomic per call. No store
/// holds a lock once the call returns.
mod memory;
mod sqlite;

pub use memory::MemoryQueueStore;
pub use sqlite::SqliteQueueStore;

use crate::backoff::Backoff;
use crate::error::QueueError;
use crate::types::{Lease, LeaseToken, QueueItem, QueueKey, QueueStatus};

/// Persistence backend for [`RetryQueue`](crate::RetryQueue).
pub trait QueueStore: Send + Sync {
    /// Insert or overwrite `key`. Overwriting resets the schedule, clears any
    /// lease and moves the item to the back of the FIFO.
    ///
    /// With `depends_on`, the item is held back while an item under that key
    /// exists in the same queue. A key cannot depend on itself.
    fn upsert(
        &self,
        queue: &str,
        key: &QueueKey,
        payload: &[u8],
        depends_on: Option<&QueueKey>,
        now: u64,
    ) -> Result<(), QueueError>;

    /// Lease up to `max` available items, oldest first, under one new token.
    /// Items whose dependency is still queued are skipped.
    fn pop(&self, queue: &str, max: usize, now: u64, backoff: &Backoff)
        -> Result<Lease, QueueError>;

    /// Delete the named items still held under `token`. Returns rows removed.
    fn commit(&self, queue: &str, token: &LeaseToken, keys: &[QueueKey])
        -> Result<usize, QueueError>;

    /// Release the named items still held under `token`, keeping their schedule.
    fn cancel(&self, queue: &str, token: &LeaseToken, keys: &[QueueKey])
        -> Result<usize, QueueError>;

    /// Release every lease granted before `older_than` and make the item due
    /// at its last run time.
    fn recover_dead(&self, queue: &str, older_than: u64) -> Result<usize, QueueError>;

    fn get(&self, queue: &str, key: &QueueKey) -> Result<Option<QueueItem>, QueueError>;

    fn status(&self, queue: &str) -> Result<QueueStatus, QueueError>;
}

fn check_dependency(key: &QueueKey, depends_on: Option<&QueueKey>) -> Result<(), QueueError> {
    if depends_on == Some(key) {
        return Err(QueueError::InvalidKey {
            reason: format!("{key} depends on itself"),
        });
    }
    Ok(())
}
