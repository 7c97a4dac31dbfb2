/// Transfer status tracker for outgoing sends.
///
/// One record per (file, recipient). Status only moves forward (see
/// [`TransferStatus::can_advance_to`]); a new send for the same pair starts
/// a fresh record.
///
/// Pure state, no I/O. The outbox feeds it outcomes and reports the
/// transitions it returns.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{FileRef, Identity, TransferStatus};

/// Maximum number of tracked transfers (memory protection).
const MAX_TRACKED: usize = 10_000;

/// Records older than this are dropped when the tracker is full (24h).
const MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

/// A status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub file: FileRef,
    pub recipient: Identity,
    pub previous: Option<TransferStatus>,
    pub current: TransferStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub file: FileRef,
    pub recipient: Identity,
    pub status: TransferStatus,
    /// Transmission attempts for this send.
    pub attempts: u32,
    pub last_attempt_at: Option<u64>,
    pub created_at: u64,
}

pub struct TransferTracker {
    records: HashMap<(FileRef, Identity), TransferRecord>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Start a record for a new send, replacing any earlier one for the pair.
    pub fn start(
        &mut self,
        file: FileRef,
        recipient: Identity,
        status: TransferStatus,
        now: u64,
    ) -> StatusChange {
        let slot = (file, recipient.clone());
        if !self.records.contains_key(&slot) && self.records.len() >= MAX_TRACKED {
            self.evict_older_than(now.saturating_sub(MAX_AGE_MS));
            if self.records.len() >= MAX_TRACKED {
                self.evict_oldest();
            }
        }

        let previous = self
            .records
            .insert(
                slot,
                TransferRecord {
                    file,
                    recipient: recipient.clone(),
                    status,
                    attempts: 0,
                    last_attempt_at: None,
                    created_at: now,
                },
            )
            .map(|r| r.status);

        StatusChange {
            file,
            recipient,
            previous,
            current: status,
        }
    }

    pub fn record_attempt(&mut self, file: &FileRef, recipient: &Identity, now: u64) {
        if let Some(record) = self.records.get_mut(&(*file, recipient.clone())) {
            record.attempts = record.attempts.saturating_add(1);
            record.last_attempt_at = Some(now);
        }
    }

    /// Move to `status` if that is a forward transition. `None` otherwise.
    pub fn advance(
        &mut self,
        file: &FileRef,
        recipient: &Identity,
        status: TransferStatus,
    ) -> Option<StatusChange> {
        let record = self.records.get_mut(&(*file, recipient.clone()))?;
        if !record.status.can_advance_to(status) {
            return None;
        }
        let previous = record.status;
        record.status = status;
        Some(StatusChange {
            file: *file,
            recipient: recipient.clone(),
            previous: Some(previous),
            current: status,
        })
    }

    pub fn get(&self, file: &FileRef, recipient: &Identity) -> Option<&TransferRecord> {
        self.records.get(&(*file, recipient.clone()))
    }

    pub fn status(&self, file: &FileRef, recipient: &Identity) -> Option<TransferStatus> {
        self.get(file, recipient).map(|r| r.status)
    }

    /// All records for `file`, sorted by recipient.
    pub fn records_for(&self, file: &FileRef) -> Vec<TransferRecord> {
        let mut records: Vec<_> = self
            .records
            .values()
            .filter(|r| r.file == *file)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.recipient.cmp(&b.recipient));
        records
    }

    /// Whether every listed recipient has a delivered status for `file`.
    pub fn all_delivered(&self, file: &FileRef, recipients: &[Identity]) -> bool {
        !recipients.is_empty()
            && recipients
                .iter()
                .all(|r| self.status(file, r).is_some_and(TransferStatus::is_delivered))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn remove(&mut self, file: &FileRef, recipient: &Identity) -> bool {
        self.records.remove(&(*file, recipient.clone())).is_some()
    }

    /// Drop records created before `cutoff` (unix ms). Returns how many.
    pub fn evict_older_than(&mut self, cutoff: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.created_at >= cutoff);
        before - self.records.len()
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn evict_oldest(&mut self) {
        let oldest = self
            .records
            .iter()
            .min_by_key(|(_, r)| r.created_at)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.records.remove(&key);
        }
    }
}

impl Default for TransferTracker {
    fn default() -> Self {
        Self::new()
    }
}
