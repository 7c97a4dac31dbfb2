use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StorageError;
use crate::file::{FileRecord, StoredFile};
use crate::storage::DriveStorage;
use crate::types::{
    now_ms, DriveId, FileId, GlobalTransitId, Identity, PermissionSet, VersionTag,
};

#[derive(Default)]
struct Inner {
    files: HashMap<(DriveId, FileId), StoredFile>,
    grants: HashMap<(Identity, DriveId), PermissionSet>,
    /// Last change-feed timestamp handed out; keeps `modified` strictly increasing.
    clock: u64,
    /// Writes still to fail, and the error they fail with.
    failing_writes: Option<(usize, StorageError)>,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock = now_ms().max(self.clock + 1);
        self.clock
    }

    fn take_injected_failure(&mut self) -> Result<(), StorageError> {
        match self.failing_writes.take() {
            Some((n, err)) if n > 0 => {
                if n > 1 {
                    self.failing_writes = Some((n - 1, err.clone()));
                }
                Err(err)
            }
            _ => Ok(()),
        }
    }
}

/// In-memory [`DriveStorage`] for one node.
///
/// Writes can be made to fail on demand to exercise retry paths.
#[derive(Default)]
pub struct MemoryDriveStorage {
    inner: Mutex<Inner>,
}

impl MemoryDriveStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".into()))
    }

    /// Grant `permissions` to `remote` on `drive`, replacing earlier grants.
    pub fn grant(
        &self,
        remote: &Identity,
        drive: DriveId,
        permissions: PermissionSet,
    ) -> Result<(), StorageError> {
        self.lock()?
            .grants
            .insert((remote.clone(), drive), permissions);
        Ok(())
    }

    pub fn revoke(&self, remote: &Identity, drive: DriveId) -> Result<(), StorageError> {
        self.lock()?.grants.remove(&(remote.clone(), drive));
        Ok(())
    }

    /// Create a new local file. Returns its id and first version tag.
    pub fn create(
        &self,
        drive: DriveId,
        record: FileRecord,
    ) -> Result<(FileId, VersionTag), StorageError> {
        let file_id = FileId::generate();
        let tag = self.write(drive, file_id, record, None)?;
        Ok((file_id, tag))
    }

    /// Files on `drive` changed after `since`, oldest change first. Includes soft deletes.
    pub fn modified_since(&self, drive: DriveId, since: u64) -> Result<Vec<StoredFile>, StorageError> {
        let inner = self.lock()?;
        let mut changed: Vec<StoredFile> = inner
            .files
            .values()
            .filter(|f| f.drive == drive && f.modified > since)
            .cloned()
            .collect();
        changed.sort_by_key(|f| f.modified);
        Ok(changed)
    }

    /// Every row on `drive`, deleted or not.
    pub fn files(&self, drive: DriveId) -> Result<Vec<StoredFile>, StorageError> {
        self.modified_since(drive, 0)
    }

    /// Fail the next `n` writes with [`StorageError::Unavailable`].
    pub fn fail_next_writes(&self, n: usize) -> Result<(), StorageError> {
        self.fail_next_writes_with(n, StorageError::Unavailable("injected write failure".into()))
    }

    /// Fail the next `n` writes with `err`.
    pub fn fail_next_writes_with(&self, n: usize, err: StorageError) -> Result<(), StorageError> {
        self.lock()?.failing_writes = Some((n, err));
        Ok(())
    }

    fn write(
        &self,
        drive: DriveId,
        file_id: FileId,
        record: FileRecord,
        expected: Option<VersionTag>,
    ) -> Result<VersionTag, StorageError> {
        let mut inner = self.lock()?;
        inner.take_injected_failure()?;
        let current = inner.files.get(&(drive, file_id)).map(|f| f.version_tag);
        if let Some(expected) = expected {
            if current != Some(expected) {
                return Err(StorageError::VersionConflict {
                    expected,
                    actual: current,
                });
            }
        }
        let version_tag = VersionTag::generate();
        let modified = inner.tick();
        inner.files.insert(
            (drive, file_id),
            StoredFile {
                drive,
                file_id,
                record,
                version_tag,
                is_deleted: false,
                modified,
            },
        );
        Ok(version_tag)
    }
}

#[async_trait::async_trait]
impl DriveStorage for MemoryDriveStorage {
    async fn store_or_update(
        &self,
        drive: DriveId,
        file_id: FileId,
        record: FileRecord,
        expected: Option<VersionTag>,
    ) -> Result<VersionTag, StorageError> {
        self.write(drive, file_id, record, expected)
    }

    async fn soft_delete(&self, drive: DriveId, file_id: FileId) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.take_injected_failure()?;
        let modified = inner.tick();
        let file = inner
            .files
            .get_mut(&(drive, file_id))
            .ok_or(StorageError::NotFound {
                drive,
                file: file_id,
            })?;
        file.record.clear_content();
        file.is_deleted = true;
        file.version_tag = VersionTag::generate();
        file.modified = modified;
        Ok(())
    }

    async fn lookup_by_global_transit_id(
        &self,
        drive: DriveId,
        global_transit_id: GlobalTransitId,
    ) -> Result<Option<FileId>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .files
            .values()
            .find(|f| f.drive == drive && f.global_transit_id() == Some(global_transit_id))
            .map(|f| f.file_id))
    }

    async fn lookup_permission(
        &self,
        remote: &Identity,
        drive: DriveId,
    ) -> Result<PermissionSet, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .grants
            .get(&(remote.clone(), drive))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_file(
        &self,
        drive: DriveId,
        file_id: FileId,
    ) -> Result<Option<StoredFile>, StorageError> {
        Ok(self.lock()?.files.get(&(drive, file_id)).cloned())
    }
}
