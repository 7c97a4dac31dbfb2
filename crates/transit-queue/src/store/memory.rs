use std::collections::HashMap;
use std::sync::Mutex;

use crate::backoff::Backoff;
use crate::error::QueueError;
use crate::store::{check_dependency, QueueStore};
use crate::types::{Lease, LeaseToken, QueueItem, QueueKey, QueueStatus};

struct Entry {
    item: QueueItem,
    /// Insertion sequence, tiebreaker for equal `created_at`.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<(String, QueueKey), Entry>,
    next_seq: u64,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn slot(queue: &str, key: &QueueKey) -> (String, QueueKey) {
    (queue.to_string(), key.clone())
}

impl QueueStore for MemoryQueueStore {
    fn upsert(
        &self,
        queue: &str,
        key: &QueueKey,
        payload: &[u8],
        depends_on: Option<&QueueKey>,
        now: u64,
    ) -> Result<(), QueueError> {
        check_dependency(key, depends_on)?;
        let mut inner = self.inner.lock()?;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let item = QueueItem {
            key: key.clone(),
            payload: payload.to_vec(),
            run_count: 0,
            next_run_at: now,
            last_run_at: None,
            lease: None,
            created_at: now,
            depends_on: depends_on.cloned(),
        };
        inner.entries.insert(slot(queue, key), Entry { item, seq });
        Ok(())
    }

    fn pop(
        &self,
        queue: &str,
        max: usize,
        now: u64,
        backoff: &Backoff,
    ) -> Result<Lease, QueueError> {
        if max == 0 {
            return Ok(Lease::empty());
        }
        let mut inner = self.inner.lock()?;

        let mut due: Vec<(u64, u64, QueueKey)> = inner
            .entries
            .iter()
            .filter(|((q, _), e)| q == queue && e.item.is_available(now))
            .filter(|(_, e)| match &e.item.depends_on {
                Some(dep) => !inner.entries.contains_key(&slot(queue, dep)),
                None => true,
            })
            .map(|((_, k), e)| (e.item.created_at, e.seq, k.clone()))
            .collect();
        due.sort();
        due.truncate(max);

        let token = LeaseToken::generate();
        let mut items = Vec::with_capacity(due.len());
        for (_, _, key) in due {
            if let Some(entry) = inner.entries.get_mut(&slot(queue, &key)) {
                let item = &mut entry.item;
                item.run_count = item.run_count.saturating_add(1);
                item.last_run_at = Some(now);
                item.next_run_at = now.saturating_add(backoff.delay_ms(item.run_count));
                item.lease = Some(token);
                items.push(item.clone());
            }
        }
        Ok(Lease { token, items })
    }

    fn commit(
        &self,
        queue: &str,
        token: &LeaseToken,
        keys: &[QueueKey],
    ) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock()?;
        let mut removed = 0;
        for key in keys {
            let slot = slot(queue, key);
            let held = inner
                .entries
                .get(&slot)
                .is_some_and(|e| e.item.is_held_by(token));
            if held {
                inner.entries.remove(&slot);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn cancel(
        &self,
        queue: &str,
        token: &LeaseToken,
        keys: &[QueueKey],
    ) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock()?;
        let mut released = 0;
        for key in keys {
            if let Some(entry) = inner.entries.get_mut(&slot(queue, key)) {
                if entry.item.is_held_by(token) {
                    entry.item.lease = None;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    fn recover_dead(&self, queue: &str, older_than: u64) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock()?;
        let mut recovered = 0;
        for ((q, _), entry) in inner.entries.iter_mut() {
            let item = &mut entry.item;
            if q != queue || !item.is_leased() {
                continue;
            }
            if let Some(last) = item.last_run_at.filter(|t| *t < older_than) {
                item.lease = None;
                item.next_run_at = last;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    fn get(&self, queue: &str, key: &QueueKey) -> Result<Option<QueueItem>, QueueError> {
        let inner = self.inner.lock()?;
        Ok(inner.entries.get(&slot(queue, key)).map(|e| e.item.clone()))
    }

    fn status(&self, queue: &str) -> Result<QueueStatus, QueueError> {
        let inner = self.inner.lock()?;
        let mut status = QueueStatus::default();
        for ((q, _), entry) in &inner.entries {
            if q != queue {
                continue;
            }
            status.total += 1;
            if entry.item.is_leased() {
                status.leased += 1;
            } else {
                status.next_run_at = Some(match status.next_run_at {
                    Some(t) => t.min(entry.item.next_run_at),
                    None => entry.item.next_run_at,
                });
            }
        }
        Ok(status)
    }
}
