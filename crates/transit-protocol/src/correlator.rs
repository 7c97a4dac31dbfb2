/// Maps incoming transfers onto local files.
///
/// Decides insert vs. update-in-place by global transit id, applies the
/// decision through [`DriveStorage`] under optimistic concurrency, and
/// carries delete propagation as a soft delete.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::envelope::{TransferEnvelope, TransferInstruction};
use crate::error::{StorageError, TransitError};
use crate::file::{ReferencedFile, StoredFile};
use crate::storage::DriveStorage;
use crate::types::{DriveId, FileId, FileRef, GlobalTransitId, VersionTag};

/// What applying an envelope will do to local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Insert { file_id: FileId },
    UpdateInPlace {
        file_id: FileId,
        expected_version: VersionTag,
    },
    SoftDelete { file_id: FileId },
    /// Delete for a transit id no local file carries, or one already deleted.
    NothingToDelete,
    /// The local copy was delivered by another identity. Never applied.
    NotOriginalSender { file_id: FileId },
    /// Save for a file already deleted here. Never applied, so a late
    /// update cannot bring the file back.
    FileDeleted { file_id: FileId },
}

impl Resolution {
    /// Whether applying would be refused outright.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Resolution::NotOriginalSender { .. } | Resolution::FileDeleted { .. }
        )
    }
}

/// What applying an envelope did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    Inserted {
        file_id: FileId,
        version_tag: VersionTag,
    },
    Updated {
        file_id: FileId,
        version_tag: VersionTag,
    },
    Deleted { file_id: FileId },
    NothingToDelete,
}

impl CommitOutcome {
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            CommitOutcome::Inserted { file_id, .. }
            | CommitOutcome::Updated { file_id, .. }
            | CommitOutcome::Deleted { file_id } => Some(*file_id),
            CommitOutcome::NothingToDelete => None,
        }
    }
}

#[derive(Clone)]
pub struct TransitCorrelator {
    storage: Arc<dyn DriveStorage>,
}

impl TransitCorrelator {
    pub fn new(storage: Arc<dyn DriveStorage>) -> Self {
        Self { storage }
    }

    /// Whether the file a comment or reaction points at exists locally.
    pub async fn reference_exists(&self, reference: &ReferencedFile) -> Result<bool, StorageError> {
        Ok(self
            .storage
            .lookup_by_global_transit_id(reference.drive, reference.global_transit_id)
            .await?
            .is_some())
    }

    pub async fn resolve(&self, envelope: &TransferEnvelope) -> Result<Resolution, TransitError> {
        let drive = envelope.target_drive;
        match &envelope.instruction {
            TransferInstruction::SaveFile { .. } => {
                let existing = match envelope.global_transit_id() {
                    Some(gtid) if envelope.use_global_transit_id => {
                        self.storage.lookup_by_global_transit_id(drive, gtid).await?
                    }
                    _ => None,
                };
                let Some(file_id) = existing else {
                    return Ok(Resolution::Insert {
                        file_id: FileId::generate(),
                    });
                };
                let stored = self.linked_file(drive, file_id).await?;
                if stored.sender() != Some(&envelope.sender) {
                    return Ok(Resolution::NotOriginalSender { file_id });
                }
                if stored.is_deleted {
                    return Ok(Resolution::FileDeleted { file_id });
                }
                Ok(Resolution::UpdateInPlace {
                    file_id,
                    expected_version: stored.version_tag,
                })
            }
            TransferInstruction::DeleteLinkedFile { global_transit_id } => {
                let Some(file_id) = self
                    .storage
                    .lookup_by_global_transit_id(drive, *global_transit_id)
                    .await?
                else {
                    return Ok(Resolution::NothingToDelete);
                };
                let stored = self.linked_file(drive, file_id).await?;
                if stored.sender() != Some(&envelope.sender) {
                    return Ok(Resolution::NotOriginalSender { file_id });
                }
                if stored.is_deleted {
                    return Ok(Resolution::NothingToDelete);
                }
                Ok(Resolution::SoftDelete { file_id })
            }
        }
    }

    async fn linked_file(&self, drive: DriveId, file_id: FileId) -> Result<StoredFile, TransitError> {
        match self.storage.get_file(drive, file_id).await? {
            Some(stored) => Ok(stored),
            // Index and rows disagree; let the next attempt look again.
            None => Err(StorageError::Unavailable(format!(
                "transit index points at missing file {drive}/{file_id}"
            ))
            .into()),
        }
    }

    pub async fn apply(
        &self,
        envelope: &TransferEnvelope,
        resolution: Resolution,
    ) -> Result<CommitOutcome, TransitError> {
        let drive = envelope.target_drive;
        let record = match &envelope.instruction {
            TransferInstruction::SaveFile { file, key_header } => {
                let mut record = file.clone();
                record.key_header = key_header.clone();
                record.metadata.sender = Some(envelope.sender.clone());
                if !envelope.use_global_transit_id {
                    record.metadata.global_transit_id = None;
                }
                Some(record)
            }
            TransferInstruction::DeleteLinkedFile { .. } => None,
        };

        let outcome = match (resolution, record) {
            (Resolution::Insert { file_id }, Some(record)) => {
                let version_tag = self
                    .storage
                    .store_or_update(drive, file_id, record, None)
                    .await?;
                CommitOutcome::Inserted {
                    file_id,
                    version_tag,
                }
            }
            (
                Resolution::UpdateInPlace {
                    file_id,
                    expected_version,
                },
                Some(record),
            ) => {
                let version_tag = self
                    .storage
                    .store_or_update(drive, file_id, record, Some(expected_version))
                    .await?;
                CommitOutcome::Updated {
                    file_id,
                    version_tag,
                }
            }
            (Resolution::SoftDelete { file_id }, None) => {
                self.storage.soft_delete(drive, file_id).await?;
                CommitOutcome::Deleted { file_id }
            }
            (Resolution::NothingToDelete, None) => CommitOutcome::NothingToDelete,
            (resolution, _) if resolution.is_refusal() => {
                return Err(TransitError::InvalidEnvelope {
                    reason: format!("{resolution:?} cannot be applied"),
                })
            }
            (resolution, _) => {
                return Err(TransitError::InvalidEnvelope {
                    reason: format!("{resolution:?} does not match the instruction"),
                })
            }
        };
        Ok(outcome)
    }

    // ── Sender side ─────────────────────────────────────────────────

    /// Return the file's transit id, assigning and storing one if it has none.
    pub async fn ensure_global_transit_id(
        &self,
        file: &FileRef,
    ) -> Result<GlobalTransitId, TransitError> {
        let stored = self
            .storage
            .get_file(file.drive, file.file)
            .await?
            .filter(|f| !f.is_deleted)
            .ok_or(TransitError::FileNotFound(*file))?;
        if let Some(gtid) = stored.global_transit_id() {
            return Ok(gtid);
        }

        let gtid = GlobalTransitId::generate();
        let mut record = stored.record;
        record.metadata.global_transit_id = Some(gtid);
        self.storage
            .store_or_update(file.drive, file.file, record, Some(stored.version_tag))
            .await?;
        tracing::debug!("correlator: assigned transit id {gtid} to {file}");
        Ok(gtid)
    }

    /// Soft-delete the sender's own copy.
    pub async fn soft_delete_local(&self, file: &FileRef) -> Result<(), TransitError> {
        self.storage.soft_delete(file.drive, file.file).await?;
        Ok(())
    }
}
