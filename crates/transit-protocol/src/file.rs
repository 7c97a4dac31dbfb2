use serde::{Deserialize, Serialize};

use crate::types::{DriveId, FileId, GlobalTransitId, Identity, VersionTag};

/// Pointer from a comment or reaction to the file it is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferencedFile {
    pub drive: DriveId,
    pub global_transit_id: GlobalTransitId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub global_transit_id: Option<GlobalTransitId>,
    /// Identity that delivered this file. `None` for files created locally.
    pub sender: Option<Identity>,
    /// Set on comment and reaction files.
    pub referenced_file: Option<ReferencedFile>,
    pub content_type: String,
    pub app_data: String,
    pub created: u64,
    pub updated: u64,
}

/// File content as written through [`DriveStorage`](crate::storage::DriveStorage).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub metadata: FileMetadata,
    pub payload: Vec<u8>,
    pub thumbnails: Vec<Thumbnail>,
    /// Encrypted key header. Opaque here.
    pub key_header: Vec<u8>,
}

impl FileRecord {
    pub fn new(content_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            metadata: FileMetadata {
                content_type: content_type.into(),
                ..FileMetadata::default()
            },
            payload,
            ..Self::default()
        }
    }

    pub fn with_reference(mut self, reference: ReferencedFile) -> Self {
        self.metadata.referenced_file = Some(reference);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: Thumbnail) -> Self {
        self.thumbnails.push(thumbnail);
        self
    }

    pub fn with_key_header(mut self, key_header: Vec<u8>) -> Self {
        self.key_header = key_header;
        self
    }

    /// Drop content, keep metadata. What a soft-deleted row still answers with.
    pub fn clear_content(&mut self) {
        self.payload.clear();
        self.thumbnails.clear();
        self.key_header.clear();
    }

    pub fn has_content(&self) -> bool {
        !self.payload.is_empty() || !self.thumbnails.is_empty() || !self.key_header.is_empty()
    }
}

/// A file row as the storage layer returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub drive: DriveId,
    pub file_id: FileId,
    pub record: FileRecord,
    pub version_tag: VersionTag,
    pub is_deleted: bool,
    /// Change-feed timestamp, advanced by every write and by soft delete.
    pub modified: u64,
}

impl StoredFile {
    pub fn global_transit_id(&self) -> Option<GlobalTransitId> {
        self.record.metadata.global_transit_id
    }

    pub fn sender(&self) -> Option<&Identity> {
        self.record.metadata.sender.as_ref()
    }
}
