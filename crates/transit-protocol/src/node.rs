use std::sync::Arc;

use transit_queue::{QueueStore, RetryQueue};

use crate::config::{TransitConfig, INBOX_QUEUE, OUTBOX_QUEUE};
use crate::envelope::TransferEnvelope;
use crate::error::TransitError;
use crate::inbox::{Inbox, InboxReport};
use crate::outbox::{Outbox, OutboxReport, SendResult};
use crate::permission::{PermissionGate, StoragePermissionGate};
use crate::storage::DriveStorage;
use crate::tracker::TransferRecord;
use crate::transport::{DeliveryMode, PeerResponse, PeerTransport};
use crate::types::{FileRef, Identity, TransitOptions};

/// One identity's transit endpoint: an outbox and an inbox over shared
/// storage, with both logical queues in one queue store.
#[derive(Clone)]
pub struct TransitNode {
    identity: Identity,
    outbox: Outbox,
    inbox: Inbox,
    config: TransitConfig,
}

impl TransitNode {
    /// Build a node whose permission checks read grants from `storage`.
    pub fn new(
        identity: Identity,
        storage: Arc<dyn DriveStorage>,
        transport: Arc<dyn PeerTransport>,
        queue_store: Arc<dyn QueueStore>,
        config: TransitConfig,
    ) -> Self {
        let gate: Arc<dyn PermissionGate> = Arc::new(StoragePermissionGate::new(storage.clone()));
        Self::with_gate(identity, storage, gate, transport, queue_store, config)
    }

    pub fn with_gate(
        identity: Identity,
        storage: Arc<dyn DriveStorage>,
        gate: Arc<dyn PermissionGate>,
        transport: Arc<dyn PeerTransport>,
        queue_store: Arc<dyn QueueStore>,
        config: TransitConfig,
    ) -> Self {
        let outbox = Outbox::new(
            identity.clone(),
            storage.clone(),
            gate.clone(),
            transport,
            RetryQueue::new(config.queue_config(OUTBOX_QUEUE), queue_store.clone()),
            config.outbox_batch_size,
        );
        let inbox = Inbox::new(
            identity.clone(),
            storage,
            gate,
            RetryQueue::new(config.queue_config(INBOX_QUEUE), queue_store),
            config.inbox_batch_size,
        );
        Self {
            identity,
            outbox,
            inbox,
            config,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn config(&self) -> &TransitConfig {
        &self.config
    }

    pub async fn send(
        &self,
        file: &FileRef,
        recipients: &[Identity],
        options: &TransitOptions,
    ) -> Result<SendResult, TransitError> {
        self.outbox.send(file, recipients, options).await
    }

    pub async fn send_delete(
        &self,
        file: &FileRef,
        recipients: &[Identity],
        options: &TransitOptions,
    ) -> Result<SendResult, TransitError> {
        self.outbox.send_delete(file, recipients, options).await
    }

    pub async fn process_outbox(&self) -> Result<OutboxReport, TransitError> {
        self.outbox.process_outbox().await
    }

    pub fn stage(&self, envelope: &TransferEnvelope) -> Result<(), TransitError> {
        self.inbox.stage(envelope)
    }

    pub async fn receive(
        &self,
        envelope: TransferEnvelope,
        mode: DeliveryMode,
    ) -> Result<PeerResponse, TransitError> {
        self.inbox.receive(envelope, mode).await
    }

    pub async fn process_inbox(&self) -> Result<InboxReport, TransitError> {
        self.inbox.process_inbox().await
    }

    pub fn transfer_status(&self, file: &FileRef) -> Vec<TransferRecord> {
        self.outbox.transfer_status(file)
    }

    pub fn transfer_status_for(
        &self,
        file: &FileRef,
        recipient: &Identity,
    ) -> Option<TransferRecord> {
        self.outbox.transfer_status_for(file, recipient)
    }

    /// Recover dead leases in both queues. Returns `(outbox, inbox)` counts.
    pub fn recover_dead(&self, older_than: u64) -> Result<(usize, usize), TransitError> {
        Ok((
            self.outbox.recover_dead(older_than)?,
            self.inbox.recover_dead(older_than)?,
        ))
    }
}
