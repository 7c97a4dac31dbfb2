/// Sender side of transit.
///
/// `send` checks each recipient's grant, then either delivers right away
/// (await-response) or enqueues one item per recipient for
/// `process_outbox`. Every recipient gets a [`TransferRecord`] in the
/// tracker; statuses only move forward.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use transit_queue::{QueueKey, QueueStatus, RetryQueue};

use crate::correlator::TransitCorrelator;
use crate::envelope::TransferEnvelope;
use crate::error::{TransitError, TransportError};
use crate::permission::PermissionGate;
use crate::storage::DriveStorage;
use crate::tracker::{StatusChange, TransferRecord, TransferTracker};
use crate::transport::{DeliveryMode, PeerResponse, PeerTransport};
use crate::types::{now_ms, FileRef, Identity, SendSchedule, TransferStatus, TransitOptions};

/// Payload of one outbox queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub file: FileRef,
    pub recipient: Identity,
    pub envelope: TransferEnvelope,
}

impl OutboxItem {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransitError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransitError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

/// Per-recipient statuses right after `send` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub file: FileRef,
    pub statuses: BTreeMap<Identity, TransferStatus>,
}

impl SendResult {
    pub fn status(&self, recipient: &Identity) -> Option<TransferStatus> {
        self.statuses.get(recipient).copied()
    }
}

/// Result of one `process_outbox` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxReport {
    pub attempted: usize,
    pub delivered: usize,
    /// Denied or rejected by the recipient. Not retried.
    pub rejected: usize,
    /// Transport failed; retried after backoff.
    pub retry_later: usize,
    /// Undecodable queue payloads, dropped.
    pub malformed: usize,
    /// Re-sent while in flight; the newer item stays queued.
    pub superseded: usize,
    pub changes: Vec<StatusChange>,
}

/// Key of the outbox item for one (file, recipient) pair.
pub fn outbox_key(file: &FileRef, recipient: &Identity) -> Result<QueueKey, TransitError> {
    Ok(QueueKey::new(file.to_string(), recipient.as_str())?)
}

fn response_status(response: &PeerResponse) -> TransferStatus {
    match response {
        PeerResponse::AcceptedIntoInbox => TransferStatus::DeliveredToInbox,
        PeerResponse::AcceptedDirectWrite => TransferStatus::DeliveredToTargetDrive,
        PeerResponse::AccessDenied => TransferStatus::RecipientReturnedAccessDenied,
        PeerResponse::Rejected { .. } => TransferStatus::TotalRejectionClientShouldRetry,
    }
}

#[derive(Clone)]
pub struct Outbox {
    local: Identity,
    storage: Arc<dyn DriveStorage>,
    correlator: TransitCorrelator,
    gate: Arc<dyn PermissionGate>,
    transport: Arc<dyn PeerTransport>,
    queue: RetryQueue,
    tracker: Arc<Mutex<TransferTracker>>,
    batch_size: usize,
}

impl Outbox {
    pub fn new(
        local: Identity,
        storage: Arc<dyn DriveStorage>,
        gate: Arc<dyn PermissionGate>,
        transport: Arc<dyn PeerTransport>,
        queue: RetryQueue,
        batch_size: usize,
    ) -> Self {
        Self {
            local,
            correlator: TransitCorrelator::new(storage.clone()),
            storage,
            gate,
            transport,
            queue,
            tracker: Arc::new(Mutex::new(TransferTracker::new())),
            batch_size,
        }
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    fn tracker(&self) -> MutexGuard<'_, TransferTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Send ────────────────────────────────────────────────────────

    /// Send a local file to `recipients`.
    pub async fn send(
        &self,
        file: &FileRef,
        recipients: &[Identity],
        options: &TransitOptions,
    ) -> Result<SendResult, TransitError> {
        self.check_recipients(recipients)?;
        let stored = self
            .storage
            .get_file(file.drive, file.file)
            .await?
            .filter(|f| !f.is_deleted)
            .ok_or(TransitError::FileNotFound(*file))?;

        let mut record = stored.record;
        if options.use_global_transit_id {
            let gtid = self.correlator.ensure_global_transit_id(file).await?;
            record.metadata.global_transit_id = Some(gtid);
        }
        let key_header = std::mem::take(&mut record.key_header);
        let target_drive = options.remote_target_drive.unwrap_or(file.drive);

        let mut envelope =
            TransferEnvelope::save_file(self.local.clone(), target_drive, record, key_header);
        envelope.use_global_transit_id = options.use_global_transit_id;
        envelope.is_transient = options.is_transient;
        envelope.recipients = recipients.to_vec();

        let statuses = self.dispatch(file, &envelope, options.schedule).await?;
        if options.is_transient {
            self.cleanup_transient(file, recipients).await;
        }
        Ok(SendResult {
            file: *file,
            statuses,
        })
    }

    /// Soft-delete a local file and propagate the delete to `recipients`.
    ///
    /// Recipients find their copy by global transit id, so the file must
    /// have been sent with one.
    pub async fn send_delete(
        &self,
        file: &FileRef,
        recipients: &[Identity],
        options: &TransitOptions,
    ) -> Result<SendResult, TransitError> {
        self.check_recipients(recipients)?;
        let stored = self
            .storage
            .get_file(file.drive, file.file)
            .await?
            .ok_or(TransitError::FileNotFound(*file))?;
        let gtid = stored
            .global_transit_id()
            .ok_or(TransitError::MissingGlobalTransitId(*file))?;
        if !stored.is_deleted {
            self.correlator.soft_delete_local(file).await?;
        }

        let target_drive = options.remote_target_drive.unwrap_or(file.drive);
        let mut envelope =
            TransferEnvelope::delete_linked_file(self.local.clone(), target_drive, gtid);
        envelope.recipients = recipients.to_vec();

        let statuses = self.dispatch(file, &envelope, options.schedule).await?;
        Ok(SendResult {
            file: *file,
            statuses,
        })
    }

    fn check_recipients(&self, recipients: &[Identity]) -> Result<(), TransitError> {
        if recipients.is_empty() {
            return Err(TransitError::InvalidEnvelope {
                reason: "no recipients".into(),
            });
        }
        if recipients.contains(&self.local) {
            return Err(TransitError::InvalidEnvelope {
                reason: format!("{} cannot send to itself", self.local),
            });
        }
        Ok(())
    }

    /// Local copy of the file a comment or reaction points at, if this node has one.
    async fn referenced_local_file(
        &self,
        envelope: &TransferEnvelope,
    ) -> Result<Option<FileRef>, TransitError> {
        let Some(reference) = envelope.referenced_file() else {
            return Ok(None);
        };
        let local = self
            .storage
            .lookup_by_global_transit_id(reference.drive, reference.global_transit_id)
            .await?;
        Ok(local.map(|id| FileRef::new(reference.drive, id)))
    }

    async fn dispatch(
        &self,
        file: &FileRef,
        envelope: &TransferEnvelope,
        schedule: SendSchedule,
    ) -> Result<BTreeMap<Identity, TransferStatus>, TransitError> {
        let capability = envelope.required_capability();
        let mut statuses = BTreeMap::new();
        // Queued comments wait behind a still-queued send of the file they reference.
        let referenced = match schedule {
            SendSchedule::Queued => self.referenced_local_file(envelope).await?,
            SendSchedule::SendNowAwaitResponse => None,
        };

        for recipient in &envelope.recipients {
            if statuses.contains_key(recipient) {
                continue;
            }
            let now = now_ms();
            if !self
                .gate
                .check(recipient, envelope.target_drive, capability)
                .await?
            {
                tracing::warn!("outbox: {recipient} lacks {capability:?} for {file}");
                self.tracker().start(
                    *file,
                    recipient.clone(),
                    TransferStatus::RecipientReturnedAccessDenied,
                    now,
                );
                statuses.insert(
                    recipient.clone(),
                    TransferStatus::RecipientReturnedAccessDenied,
                );
                continue;
            }

            let per_recipient = envelope.for_recipient();
            let status = match schedule {
                SendSchedule::SendNowAwaitResponse => {
                    {
                        let mut tracker = self.tracker();
                        tracker.start(*file, recipient.clone(), TransferStatus::TransferKeyCreated, now);
                        tracker.record_attempt(file, recipient, now);
                    }
                    let status = self
                        .deliver(recipient, &per_recipient, DeliveryMode::AwaitProcessing)
                        .await;
                    self.tracker().advance(file, recipient, status);
                    status
                }
                SendSchedule::Queued => {
                    let item = OutboxItem {
                        file: *file,
                        recipient: recipient.clone(),
                        envelope: per_recipient,
                    };
                    let key = outbox_key(file, recipient)?;
                    let depends_on = referenced
                        .map(|r| outbox_key(&r, recipient))
                        .transpose()?
                        .filter(|dep| *dep != key);
                    self.queue
                        .upsert_after(&key, &item.to_bytes()?, depends_on.as_ref())?;
                    self.tracker().start(
                        *file,
                        recipient.clone(),
                        TransferStatus::TransferKeyCreated,
                        now,
                    );
                    tracing::debug!("outbox: queued {file} for {recipient}");
                    TransferStatus::TransferKeyCreated
                }
            };
            statuses.insert(recipient.clone(), status);
        }
        Ok(statuses)
    }

    /// Synchronous delivery. Transport failures count as a total rejection.
    async fn deliver(
        &self,
        recipient: &Identity,
        envelope: &TransferEnvelope,
        mode: DeliveryMode,
    ) -> TransferStatus {
        match self.transport.deliver(recipient, envelope, mode).await {
            Ok(response) => {
                let status = response_status(&response);
                if let PeerResponse::Rejected { reason } = &response {
                    tracing::warn!("outbox: {recipient} rejected {}: {reason}", envelope.transfer_id);
                } else {
                    tracing::info!("outbox: {} to {recipient}: {status:?}", envelope.transfer_id);
                }
                status
            }
            Err(e) => {
                tracing::warn!("outbox: delivery to {recipient} failed: {e}");
                TransferStatus::TotalRejectionClientShouldRetry
            }
        }
    }

    // ── Drain ───────────────────────────────────────────────────────

    /// Deliver one batch of queued items.
    pub async fn process_outbox(&self) -> Result<OutboxReport, TransitError> {
        let lease = self.queue.pop(self.batch_size)?;
        let mut report = OutboxReport::default();

        for item in &lease.items {
            report.attempted += 1;
            let keys = [item.key.clone()];

            let OutboxItem {
                file,
                recipient,
                envelope,
            } = match OutboxItem::from_bytes(&item.payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::error!("outbox: dropping undecodable item {}: {e}", item.key);
                    self.queue.commit(&lease.token, &keys)?;
                    report.malformed += 1;
                    continue;
                }
            };

            self.tracker().record_attempt(&file, &recipient, now_ms());
            let response = match self
                .transport
                .deliver(&recipient, &envelope, DeliveryMode::StageOnly)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.retry_later(&lease.token, &item.key, item.run_count, &e)?;
                    report.retry_later += 1;
                    continue;
                }
            };

            if self.queue.commit(&lease.token, &keys)? == 0 {
                tracing::debug!("outbox: {file} to {recipient} was re-sent meanwhile");
                report.superseded += 1;
                continue;
            }

            let status = response_status(&response);
            if let Some(change) = self.tracker().advance(&file, &recipient, status) {
                report.changes.push(change);
            }
            if status.is_delivered() {
                tracing::info!("outbox: {file} delivered to {recipient}: {status:?}");
                report.delivered += 1;
                if envelope.is_transient {
                    self.cleanup_transient(&file, &envelope.recipients).await;
                }
            } else {
                tracing::warn!("outbox: {recipient} refused {file}: {response:?}");
                report.rejected += 1;
            }
        }
        Ok(report)
    }

    fn retry_later(
        &self,
        token: &transit_queue::LeaseToken,
        key: &QueueKey,
        run_count: u32,
        error: &TransportError,
    ) -> Result<(), TransitError> {
        self.queue.cancel(token, std::slice::from_ref(key))?;
        let delay = self.queue.backoff().delay(run_count);
        tracing::debug!("outbox: attempt {run_count} for {key} failed ({error}); retry in {delay:?}");
        Ok(())
    }

    /// Soft-delete the sender's copy of a transient file once every recipient has it.
    async fn cleanup_transient(&self, file: &FileRef, recipients: &[Identity]) {
        if !self.tracker().all_delivered(file, recipients) {
            return;
        }
        match self.storage.get_file(file.drive, file.file).await {
            Ok(Some(stored)) if !stored.is_deleted => {}
            Ok(_) => return,
            Err(e) => {
                tracing::warn!("outbox: transient cleanup of {file} skipped: {e}");
                return;
            }
        }
        match self.correlator.soft_delete_local(file).await {
            Ok(()) => tracing::info!("outbox: transient {file} distributed, local copy deleted"),
            Err(e) => tracing::warn!("outbox: transient cleanup of {file} failed: {e}"),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Transfer records for every recipient of `file`.
    pub fn transfer_status(&self, file: &FileRef) -> Vec<TransferRecord> {
        self.tracker().records_for(file)
    }

    pub fn transfer_status_for(
        &self,
        file: &FileRef,
        recipient: &Identity,
    ) -> Option<TransferRecord> {
        self.tracker().get(file, recipient).cloned()
    }

    /// Release outbox leases granted before `older_than` (unix ms).
    pub fn recover_dead(&self, older_than: u64) -> Result<usize, TransitError> {
        Ok(self.queue.recover_dead(older_than)?)
    }

    pub fn queue_status(&self) -> Result<QueueStatus, TransitError> {
        Ok(self.queue.status()?)
    }

    /// Forget transfer records created before `cutoff` (unix ms).
    pub fn evict_records_older_than(&self, cutoff: u64) -> usize {
        self.tracker().evict_older_than(cutoff)
    }
}
