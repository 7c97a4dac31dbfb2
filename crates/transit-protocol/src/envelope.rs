/// What one node hands another for a single file operation.
///
/// Serialized as MessagePack on the wire and in the inbox queue.
use serde::{Deserialize, Serialize};

use crate::error::TransitError;
use crate::file::{FileRecord, ReferencedFile};
use crate::types::{now_ms, Capability, DriveId, GlobalTransitId, Identity, TransferId};

/// Upper bound on recipients listed in one envelope.
pub const MAX_RECIPIENTS: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferInstruction {
    /// Write (insert or update in place) a file on the target drive.
    SaveFile {
        file: FileRecord,
        /// Key header for the recipient. Replaces the sender's own.
        key_header: Vec<u8>,
    },
    /// Soft-delete the recipient's copy of a file, found by its transit id.
    DeleteLinkedFile { global_transit_id: GlobalTransitId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEnvelope {
    pub transfer_id: TransferId,
    pub sender: Identity,
    pub target_drive: DriveId,
    pub instruction: TransferInstruction,
    pub use_global_transit_id: bool,
    pub is_transient: bool,
    /// Every recipient of the originating send, not only this envelope's.
    pub recipients: Vec<Identity>,
    /// Unix ms.
    pub sent_at: u64,
}

impl TransferEnvelope {
    pub fn save_file(
        sender: Identity,
        target_drive: DriveId,
        file: FileRecord,
        key_header: Vec<u8>,
    ) -> Self {
        Self::new(sender, target_drive, TransferInstruction::SaveFile { file, key_header })
    }

    pub fn delete_linked_file(
        sender: Identity,
        target_drive: DriveId,
        global_transit_id: GlobalTransitId,
    ) -> Self {
        let mut envelope = Self::new(
            sender,
            target_drive,
            TransferInstruction::DeleteLinkedFile { global_transit_id },
        );
        envelope.use_global_transit_id = true;
        envelope
    }

    fn new(sender: Identity, target_drive: DriveId, instruction: TransferInstruction) -> Self {
        Self {
            transfer_id: TransferId::generate(),
            sender,
            target_drive,
            instruction,
            use_global_transit_id: false,
            is_transient: false,
            recipients: Vec::new(),
            sent_at: now_ms(),
        }
    }

    /// Same envelope under a fresh transfer id, one per recipient.
    pub fn for_recipient(&self) -> Self {
        Self {
            transfer_id: TransferId::generate(),
            sent_at: now_ms(),
            ..self.clone()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransitError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransitError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Capability the sender must hold on the target drive.
    pub fn required_capability(&self) -> Capability {
        if self.referenced_file().is_some() {
            Capability::WriteReactionsAndComments
        } else {
            Capability::Write
        }
    }

    pub fn referenced_file(&self) -> Option<ReferencedFile> {
        match &self.instruction {
            TransferInstruction::SaveFile { file, .. } => file.metadata.referenced_file,
            TransferInstruction::DeleteLinkedFile { .. } => None,
        }
    }

    pub fn global_transit_id(&self) -> Option<GlobalTransitId> {
        match &self.instruction {
            TransferInstruction::SaveFile { file, .. } => file.metadata.global_transit_id,
            TransferInstruction::DeleteLinkedFile { global_transit_id } => {
                Some(*global_transit_id)
            }
        }
    }

    /// Structural checks. A failing envelope can never be applied.
    pub fn validate(&self) -> Result<(), TransitError> {
        let invalid = |reason: &str| -> Result<(), TransitError> {
            Err(TransitError::InvalidEnvelope {
                reason: reason.to_string(),
            })
        };
        if self.sender.as_str().is_empty() {
            return invalid("empty sender");
        }
        if self.recipients.len() > MAX_RECIPIENTS {
            return invalid("too many recipients");
        }
        if self.use_global_transit_id && self.global_transit_id().is_none() {
            return invalid("global transit id requested but missing");
        }
        if matches!(self.instruction, TransferInstruction::DeleteLinkedFile { .. })
            && !self.use_global_transit_id
        {
            return invalid("delete without global transit id");
        }
        Ok(())
    }
}
