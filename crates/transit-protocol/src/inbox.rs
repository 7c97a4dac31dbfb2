/// Recipient side of transit.
///
/// `stage` parks an incoming envelope in the inbox queue and returns.
/// `process_inbox` drains the queue: it validates references and grants,
/// correlates by global transit id and writes into local storage. Each
/// envelope is settled on its own; one bad envelope never stops the drain.
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use transit_queue::{QueueKey, QueueStatus, RetryQueue};

use crate::correlator::{CommitOutcome, Resolution, TransitCorrelator};
use crate::envelope::TransferEnvelope;
use crate::error::{StorageError, TransitError};
use crate::file::ReferencedFile;
use crate::permission::PermissionGate;
use crate::storage::DriveStorage;
use crate::transport::{DeliveryMode, PeerResponse};
use crate::types::{Identity, TransferId};

/// Why an envelope was discarded without retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Malformed(String),
    /// The comment or reaction points at a file this node does not have.
    DanglingReference(ReferencedFile),
    AccessDenied,
    /// The local copy was delivered by someone else.
    NotOriginalSender,
    /// The file was deleted here; a late save does not revive it.
    FileDeleted,
    /// Storage refused the write in a way a retry will not fix.
    Storage(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Malformed(reason) => write!(f, "malformed envelope: {reason}"),
            RejectReason::DanglingReference(r) => write!(
                f,
                "referenced file {} not found on drive {}",
                r.global_transit_id, r.drive
            ),
            RejectReason::AccessDenied => f.write_str("access denied"),
            RejectReason::NotOriginalSender => f.write_str("sender is not the file's original sender"),
            RejectReason::FileDeleted => f.write_str("file was deleted"),
            RejectReason::Storage(reason) => write!(f, "storage error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxOutcome {
    /// Written to the target drive; the item was committed.
    Committed(CommitOutcome),
    /// Irrecoverable; the item was committed without being applied.
    Rejected(RejectReason),
    /// Transient failure; the item was cancelled and runs again after backoff.
    RetryLater(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    /// `None` when the staged bytes could not be decoded.
    pub transfer_id: Option<TransferId>,
    pub sender: Option<Identity>,
    pub outcome: InboxOutcome,
}

/// Result of one `process_inbox` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxReport {
    pub entries: Vec<InboxEntry>,
}

impl InboxReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn committed(&self) -> usize {
        self.count(|o| matches!(o, InboxOutcome::Committed(_)))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, InboxOutcome::Rejected(_)))
    }

    pub fn retry_later(&self) -> usize {
        self.count(|o| matches!(o, InboxOutcome::RetryLater(_)))
    }

    pub fn outcome_for(&self, transfer_id: TransferId) -> Option<&InboxOutcome> {
        self.entries
            .iter()
            .find(|e| e.transfer_id == Some(transfer_id))
            .map(|e| &e.outcome)
    }

    fn count(&self, pred: impl Fn(&InboxOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}

#[derive(Clone)]
pub struct Inbox {
    local: Identity,
    correlator: TransitCorrelator,
    gate: Arc<dyn PermissionGate>,
    queue: RetryQueue,
    batch_size: usize,
}

impl Inbox {
    pub fn new(
        local: Identity,
        storage: Arc<dyn DriveStorage>,
        gate: Arc<dyn PermissionGate>,
        queue: RetryQueue,
        batch_size: usize,
    ) -> Self {
        Self {
            local,
            correlator: TransitCorrelator::new(storage),
            gate,
            queue,
            batch_size,
        }
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    /// Persist `envelope` for later processing, keyed by target drive and transfer id.
    pub fn stage(&self, envelope: &TransferEnvelope) -> Result<(), TransitError> {
        envelope.validate()?;
        let key = QueueKey::new(
            envelope.target_drive.to_string(),
            envelope.transfer_id.to_string(),
        )?;
        self.queue.upsert(&key, &envelope.to_bytes()?)?;
        tracing::debug!(
            "inbox[{}]: staged {} from {}",
            self.local,
            envelope.transfer_id,
            envelope.sender
        );
        Ok(())
    }

    /// Inbound transport handler: perimeter check, stage, optionally process.
    pub async fn receive(
        &self,
        envelope: TransferEnvelope,
        mode: DeliveryMode,
    ) -> Result<PeerResponse, TransitError> {
        if let Err(e) = envelope.validate() {
            return Ok(PeerResponse::Rejected {
                reason: e.to_string(),
            });
        }
        let allowed = self
            .gate
            .check(
                &envelope.sender,
                envelope.target_drive,
                envelope.required_capability(),
            )
            .await?;
        if !allowed {
            tracing::warn!(
                "inbox[{}]: refused {} from {}: access denied",
                self.local,
                envelope.transfer_id,
                envelope.sender
            );
            return Ok(PeerResponse::AccessDenied);
        }

        let transfer_id = envelope.transfer_id;
        self.stage(&envelope)?;
        if mode == DeliveryMode::StageOnly {
            return Ok(PeerResponse::AcceptedIntoInbox);
        }

        let report = self.process_inbox().await?;
        Ok(match report.outcome_for(transfer_id) {
            Some(InboxOutcome::Committed(_)) => PeerResponse::AcceptedDirectWrite,
            Some(InboxOutcome::Rejected(RejectReason::AccessDenied)) => PeerResponse::AccessDenied,
            Some(InboxOutcome::Rejected(reason)) => PeerResponse::Rejected {
                reason: reason.to_string(),
            },
            // Retrying, or not in this batch: it is staged either way.
            Some(InboxOutcome::RetryLater(_)) | None => PeerResponse::AcceptedIntoInbox,
        })
    }

    /// Drain up to one batch of staged envelopes.
    pub async fn process_inbox(&self) -> Result<InboxReport, TransitError> {
        let lease = self.queue.pop(self.batch_size)?;
        let mut report = InboxReport::default();

        for item in &lease.items {
            let entry = self.process_one(&item.payload).await;
            let keys = [item.key.clone()];
            match entry.outcome {
                InboxOutcome::RetryLater(_) => self.queue.cancel(&lease.token, &keys)?,
                _ => self.queue.commit(&lease.token, &keys)?,
            };
            report.entries.push(entry);
        }

        if !report.is_empty() {
            tracing::debug!(
                "inbox[{}]: processed {} (committed {}, rejected {}, retrying {})",
                self.local,
                report.entries.len(),
                report.committed(),
                report.rejected(),
                report.retry_later()
            );
        }
        Ok(report)
    }

    async fn process_one(&self, payload: &[u8]) -> InboxEntry {
        let envelope = match TransferEnvelope::from_bytes(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("inbox[{}]: discarding undecodable item: {e}", self.local);
                return InboxEntry {
                    transfer_id: None,
                    sender: None,
                    outcome: InboxOutcome::Rejected(RejectReason::Malformed(e.to_string())),
                };
            }
        };
        let outcome = self.apply(&envelope).await;
        match &outcome {
            InboxOutcome::Committed(result) => tracing::info!(
                "inbox[{}]: {} from {} committed: {result:?}",
                self.local,
                envelope.transfer_id,
                envelope.sender
            ),
            InboxOutcome::Rejected(reason) => tracing::warn!(
                "inbox[{}]: {} from {} rejected: {reason}",
                self.local,
                envelope.transfer_id,
                envelope.sender
            ),
            InboxOutcome::RetryLater(reason) => tracing::debug!(
                "inbox[{}]: {} from {} will retry: {reason}",
                self.local,
                envelope.transfer_id,
                envelope.sender
            ),
        }
        InboxEntry {
            transfer_id: Some(envelope.transfer_id),
            sender: Some(envelope.sender),
            outcome,
        }
    }

    async fn apply(&self, envelope: &TransferEnvelope) -> InboxOutcome {
        if let Err(e) = envelope.validate() {
            return InboxOutcome::Rejected(RejectReason::Malformed(e.to_string()));
        }

        if let Some(reference) = envelope.referenced_file() {
            match self.correlator.reference_exists(&reference).await {
                Ok(true) => {}
                Ok(false) => {
                    return InboxOutcome::Rejected(RejectReason::DanglingReference(reference))
                }
                Err(e) => return storage_failure(e),
            }
        }

        // Grants may have changed since the envelope was staged.
        match self
            .gate
            .check(
                &envelope.sender,
                envelope.target_drive,
                envelope.required_capability(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => return InboxOutcome::Rejected(RejectReason::AccessDenied),
            Err(e) => return storage_failure(e),
        }

        let applied = match self.correlator.resolve(envelope).await {
            Ok(Resolution::NotOriginalSender { .. }) => {
                return InboxOutcome::Rejected(RejectReason::NotOriginalSender)
            }
            Ok(Resolution::FileDeleted { .. }) => {
                return InboxOutcome::Rejected(RejectReason::FileDeleted)
            }
            Ok(resolution) => self.correlator.apply(envelope, resolution).await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(outcome) => InboxOutcome::Committed(outcome),
            Err(TransitError::Storage(e)) => storage_failure(e),
            Err(e) => InboxOutcome::Rejected(RejectReason::Malformed(e.to_string())),
        }
    }

    /// Release inbox leases granted before `older_than` (unix ms).
    pub fn recover_dead(&self, older_than: u64) -> Result<usize, TransitError> {
        Ok(self.queue.recover_dead(older_than)?)
    }

    pub fn queue_status(&self) -> Result<QueueStatus, TransitError> {
        Ok(self.queue.status()?)
    }
}

fn storage_failure(e: StorageError) -> InboxOutcome {
    if e.is_transient() {
        InboxOutcome::RetryLater(e.to_string())
    } else {
        InboxOutcome::Rejected(RejectReason::Storage(e.to_string()))
    }
}
