use std::sync::Arc;

use crate::error::StorageError;
use crate::storage::DriveStorage;
use crate::types::{Capability, DriveId, Identity};

/// Decides whether a remote identity may perform `capability` on `drive`.
#[async_trait::async_trait]
pub trait PermissionGate: Send + Sync {
    async fn check(
        &self,
        remote: &Identity,
        drive: DriveId,
        capability: Capability,
    ) -> Result<bool, StorageError>;
}

/// Gate backed by the grants recorded in local storage.
#[derive(Clone)]
pub struct StoragePermissionGate {
    storage: Arc<dyn DriveStorage>,
}

impl StoragePermissionGate {
    pub fn new(storage: Arc<dyn DriveStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl PermissionGate for StoragePermissionGate {
    async fn check(
        &self,
        remote: &Identity,
        drive: DriveId,
        capability: Capability,
    ) -> Result<bool, StorageError> {
        let permissions = self.storage.lookup_permission(remote, drive).await?;
        let allowed = permissions.allows(capability);
        if !allowed {
            tracing::debug!("permission: {remote} lacks {capability:?} on {drive}");
        }
        Ok(allowed)
    }
}
