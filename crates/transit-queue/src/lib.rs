//! Lease-based retry queue.
//!
//! Items are keyed by `(scope, kind)` inside a named logical queue, leased
//! in FIFO batches, retried with doubling backoff and recovered when a
//! lease holder dies. Delivery is at-least-once: consumers must tolerate
//! seeing an item again after `recover_dead`.
//!
//! ```rust
//! use transit_queue::{QueueConfig, QueueKey, RetryQueue};
//!
//! let queue = RetryQueue::in_memory(QueueConfig::new("outbox"));
//! let key = QueueKey::new("drive/file", "recipient").unwrap();
//! queue.upsert(&key, b"payload").unwrap();
//!
//! let lease = queue.pop(10).unwrap();
//! assert_eq!(lease.len(), 1);
//! queue.commit(&lease.token, &lease.keys()).unwrap();
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod queue;
pub mod store;
pub mod types;

pub use backoff::Backoff;
pub use config::QueueConfig;
pub use error::QueueError;
pub use queue::{QueueMetrics, RetryQueue};
pub use store::{MemoryQueueStore, QueueStore, SqliteQueueStore};
pub use types::{now_ms, Lease, LeaseToken, QueueItem, QueueKey, QueueStatus};
