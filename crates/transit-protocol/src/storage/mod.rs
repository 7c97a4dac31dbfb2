/// Local drive storage, the file index the transit layer writes through.
///
/// Only the narrow surface transit needs: versioned write, soft delete,
/// lookup by transit id, permission grants, read back.
mod memory;

pub use memory::MemoryDriveStorage;

use crate::error::StorageError;
use crate::file::{FileRecord, StoredFile};
use crate::types::{DriveId, FileId, GlobalTransitId, Identity, PermissionSet, VersionTag};

#[async_trait::async_trait]
pub trait DriveStorage: Send + Sync {
    /// Write `record` as `file_id` on `drive` and return the new version tag.
    ///
    /// With `expected = Some(tag)` the stored tag must equal `tag`, otherwise
    /// the write fails with [`StorageError::VersionConflict`] and nothing
    /// changes. `None` writes unconditionally (insert or overwrite). Storage
    /// itself lets a write revive a soft-deleted row; transit never asks it to.
    async fn store_or_update(
        &self,
        drive: DriveId,
        file_id: FileId,
        record: FileRecord,
        expected: Option<VersionTag>,
    ) -> Result<VersionTag, StorageError>;

    /// Clear content, keep the row, advance its change-feed timestamp.
    async fn soft_delete(&self, drive: DriveId, file_id: FileId) -> Result<(), StorageError>;

    /// Soft-deleted rows are still found.
    async fn lookup_by_global_transit_id(
        &self,
        drive: DriveId,
        global_transit_id: GlobalTransitId,
    ) -> Result<Option<FileId>, StorageError>;

    /// What `remote` may do on `drive`. Unknown pairs yield an empty set.
    async fn lookup_permission(
        &self,
        remote: &Identity,
        drive: DriveId,
    ) -> Result<PermissionSet, StorageError>;

    async fn get_file(
        &self,
        drive: DriveId,
        file_id: FileId,
    ) -> Result<Option<StoredFile>, StorageError>;
}
