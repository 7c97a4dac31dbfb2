/// At-least-once work queue over a [`QueueStore`].
///
/// `upsert` enqueues, `pop` leases a batch, and the caller decides each
/// item's fate: `commit` (done, delete) or `cancel` (retry after backoff).
/// Leases never expire on their own; `recover_dead` releases the ones
/// whose holder vanished.
use std::sync::Arc;

use serde::Serialize;
use transit_metrics::{Counter, Gauge};

use crate::backoff::Backoff;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::store::{MemoryQueueStore, QueueStore};
use crate::types::{now_ms, Lease, LeaseToken, QueueItem, QueueKey, QueueStatus};

/// Per-queue statistics, serializable as a flat JSON object.
#[derive(Debug, Default, Serialize)]
pub struct QueueMetrics {
    pub enqueued: Counter,
    pub leased: Counter,
    pub committed: Counter,
    pub cancelled: Counter,
    pub recovered: Counter,
    /// Items leased by this handle and not yet committed or cancelled.
    pub in_flight: Gauge,
}

/// A named logical queue. Cheap to clone; clones share store and metrics.
#[derive(Clone)]
pub struct RetryQueue {
    name: Arc<str>,
    store: Arc<dyn QueueStore>,
    backoff: Backoff,
    metrics: Arc<QueueMetrics>,
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("name", &self.name)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RetryQueue {
    pub fn new(config: QueueConfig, store: Arc<dyn QueueStore>) -> Self {
        Self {
            backoff: config.backoff(),
            name: Arc::from(config.name),
            store,
            metrics: Arc::new(QueueMetrics::default()),
        }
    }

    /// Queue backed by a fresh [`MemoryQueueStore`].
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(config, Arc::new(MemoryQueueStore::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    // ── Enqueue ─────────────────────────────────────────────────────

    pub fn upsert(&self, key: &QueueKey, payload: &[u8]) -> Result<(), QueueError> {
        self.upsert_at(key, payload, now_ms())
    }

    pub fn upsert_at(&self, key: &QueueKey, payload: &[u8], now: u64) -> Result<(), QueueError> {
        self.upsert_after_at(key, payload, None, now)
    }

    /// Enqueue `key` so it is not leased while `depends_on` is still queued.
    pub fn upsert_after(
        &self,
        key: &QueueKey,
        payload: &[u8],
        depends_on: Option<&QueueKey>,
    ) -> Result<(), QueueError> {
        self.upsert_after_at(key, payload, depends_on, now_ms())
    }

    pub fn upsert_after_at(
        &self,
        key: &QueueKey,
        payload: &[u8],
        depends_on: Option<&QueueKey>,
        now: u64,
    ) -> Result<(), QueueError> {
        self.store
            .upsert(&self.name, key, payload, depends_on, now)
            .inspect_err(|e| tracing::error!("{}: upsert {key} failed: {e}", self.name))?;
        self.metrics.enqueued.inc();
        match depends_on {
            Some(dep) => tracing::debug!(
                "{}: upserted {key} after {dep} ({} bytes)",
                self.name,
                payload.len()
            ),
            None => tracing::debug!("{}: upserted {key} ({} bytes)", self.name, payload.len()),
        }
        Ok(())
    }

    // ── Lease ───────────────────────────────────────────────────────

    pub fn pop(&self, max_count: usize) -> Result<Lease, QueueError> {
        self.pop_at(max_count, now_ms())
    }

    pub fn pop_at(&self, max_count: usize, now: u64) -> Result<Lease, QueueError> {
        let lease = self
            .store
            .pop(&self.name, max_count, now, &self.backoff)
            .inspect_err(|e| tracing::error!("{}: pop failed: {e}", self.name))?;
        if !lease.is_empty() {
            let n = lease.len() as u64;
            self.metrics.leased.inc_by(n);
            self.metrics.in_flight.add(n);
            tracing::debug!("{}: leased {n} item(s) under {}", self.name, lease.token);
        }
        Ok(lease)
    }

    // ── Settle ──────────────────────────────────────────────────────

    /// Remove items still held under `token`. Absent or superseded keys are skipped.
    pub fn commit(&self, token: &LeaseToken, keys: &[QueueKey]) -> Result<usize, QueueError> {
        let removed = self
            .store
            .commit(&self.name, token, keys)
            .inspect_err(|e| tracing::error!("{}: commit failed: {e}", self.name))?;
        self.settled(keys.len(), removed, &self.metrics.committed, "committed");
        Ok(removed)
    }

    /// Release items still held under `token`; they run again at the time `pop` scheduled.
    pub fn cancel(&self, token: &LeaseToken, keys: &[QueueKey]) -> Result<usize, QueueError> {
        let released = self
            .store
            .cancel(&self.name, token, keys)
            .inspect_err(|e| tracing::error!("{}: cancel failed: {e}", self.name))?;
        self.settled(keys.len(), released, &self.metrics.cancelled, "cancelled");
        Ok(released)
    }

    fn settled(&self, requested: usize, affected: usize, counter: &Counter, what: &str) {
        counter.inc_by(affected as u64);
        self.metrics.in_flight.sub(requested as u64);
        if affected < requested {
            tracing::debug!(
                "{}: {what} {affected} of {requested}; the rest were superseded or gone",
                self.name
            );
        }
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Release leases granted before `older_than` (unix ms).
    pub fn recover_dead(&self, older_than: u64) -> Result<usize, QueueError> {
        let recovered = self
            .store
            .recover_dead(&self.name, older_than)
            .inspect_err(|e| tracing::error!("{}: recover_dead failed: {e}", self.name))?;
        if recovered > 0 {
            self.metrics.recovered.inc_by(recovered as u64);
            tracing::warn!("{}: recovered {recovered} dead lease(s)", self.name);
        }
        Ok(recovered)
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn get(&self, key: &QueueKey) -> Result<Option<QueueItem>, QueueError> {
        self.store.get(&self.name, key)
    }

    pub fn status(&self) -> Result<QueueStatus, QueueError> {
        self.store.status(&self.name)
    }

    /// Earliest time an unleased item becomes due.
    pub fn next_scheduled(&self) -> Result<Option<u64>, QueueError> {
        Ok(self.status()?.next_run_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> RetryQueue {
        RetryQueue::in_memory(QueueConfig::new("test"))
    }

    fn key(kind: &str) -> QueueKey {
        QueueKey::new("scope", kind).unwrap()
    }

    #[test]
    fn pop_zero_is_empty() {
        let q = queue();
        q.upsert_at(&key("a"), b"x", 0).unwrap();
        assert!(q.pop_at(0, 0).unwrap().is_empty());
        assert_eq!(q.status().unwrap().leased, 0);
    }

    #[test]
    fn metrics_follow_lifecycle() {
        let q = queue();
        q.upsert_at(&key("a"), b"", 0).unwrap();
        q.upsert_at(&key("b"), b"", 0).unwrap();
        let lease = q.pop_at(10, 0).unwrap();
        assert_eq!(q.metrics().in_flight.get(), 2);

        q.commit(&lease.token, &[key("a")]).unwrap();
        q.cancel(&lease.token, &[key("b")]).unwrap();

        let m = q.metrics();
        assert_eq!(m.enqueued.get(), 2);
        assert_eq!(m.leased.get(), 2);
        assert_eq!(m.committed.get(), 1);
        assert_eq!(m.cancelled.get(), 1);
        assert_eq!(m.in_flight.get(), 0);

        let json = serde_json::to_value(m).unwrap();
        assert_eq!(json["committed"], 1);
    }

    #[test]
    fn next_scheduled_tracks_backoff() {
        let q = RetryQueue::in_memory(
            QueueConfig::new("test").backoff_base(Duration::from_secs(10)),
        );
        assert_eq!(q.next_scheduled().unwrap(), None);
        q.upsert_at(&key("a"), b"", 1_000).unwrap();
        assert_eq!(q.next_scheduled().unwrap(), Some(1_000));

        let lease = q.pop_at(1, 1_000).unwrap();
        // Leased items are not "scheduled" until released.
        assert_eq!(q.next_scheduled().unwrap(), None);
        q.cancel(&lease.token, &lease.keys()).unwrap();
        assert_eq!(q.next_scheduled().unwrap(), Some(11_000));
    }

    #[test]
    fn clones_share_store_and_metrics() {
        let q = queue();
        let q2 = q.clone();
        q.upsert_at(&key("a"), b"", 0).unwrap();
        assert_eq!(q2.pop_at(1, 0).unwrap().len(), 1);
        assert_eq!(q.metrics().leased.get(), 1);
    }
}
