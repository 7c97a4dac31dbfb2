//! Shared harness: identities on one loopback network, each with its own
//! in-memory drive storage and queue store.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use transit_protocol::{
    Capability, DriveId, FileId, FileRecord, FileRef, Identity, LoopbackNetwork,
    MemoryDriveStorage, PermissionSet, ReferencedFile, StoredFile, TransitConfig, TransitNode,
};
use transit_queue::{MemoryQueueStore, QueueStore};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

/// Retries are due immediately so tests can drain again without waiting.
pub fn test_config() -> TransitConfig {
    TransitConfig::new().backoff(Duration::ZERO, Duration::ZERO)
}

pub struct Peer {
    pub identity: Identity,
    pub storage: Arc<MemoryDriveStorage>,
    pub node: TransitNode,
}

impl Peer {
    pub fn new(network: &LoopbackNetwork, domain: &str) -> Self {
        Self::with_queue_store(network, domain, Arc::new(MemoryQueueStore::new()), test_config())
    }

    pub fn with_queue_store(
        network: &LoopbackNetwork,
        domain: &str,
        queue_store: Arc<dyn QueueStore>,
        config: TransitConfig,
    ) -> Self {
        let identity = Identity::from(domain);
        let storage = Arc::new(MemoryDriveStorage::new());
        let node = TransitNode::new(
            identity.clone(),
            storage.clone(),
            Arc::new(network.clone()),
            queue_store,
            config,
        );
        network.register(identity.clone(), node.inbox().clone());
        Self {
            identity,
            storage,
            node,
        }
    }

    pub fn create_file(&self, drive: DriveId, payload: &[u8]) -> FileRef {
        let record = FileRecord::new("text/plain", payload.to_vec()).with_key_header(vec![0xAA; 16]);
        self.create_record(drive, record)
    }

    pub fn create_comment(&self, drive: DriveId, about: ReferencedFile, text: &str) -> FileRef {
        let record = FileRecord::new("text/plain", text.as_bytes().to_vec()).with_reference(about);
        self.create_record(drive, record)
    }

    pub fn create_record(&self, drive: DriveId, record: FileRecord) -> FileRef {
        let (file, _) = self.storage.create(drive, record).unwrap();
        FileRef::new(drive, file)
    }

    pub async fn file(&self, file: &FileRef) -> StoredFile {
        self.get(file.drive, file.file).await.unwrap()
    }

    pub async fn get(&self, drive: DriveId, file: FileId) -> Option<StoredFile> {
        use transit_protocol::DriveStorage;
        self.storage.get_file(drive, file).await.unwrap()
    }

    pub fn files(&self, drive: DriveId) -> Vec<StoredFile> {
        self.storage.files(drive).unwrap()
    }
}

/// Record on both nodes that `writer` may use `capabilities` on `owner`'s `drive`.
///
/// The owner enforces the grant on receipt; the writer consults its copy
/// before sending.
pub fn grant(owner: &Peer, writer: &Peer, drive: DriveId, capabilities: &[Capability]) {
    let set = PermissionSet::of(capabilities);
    owner.storage.grant(&writer.identity, drive, set.clone()).unwrap();
    writer.storage.grant(&owner.identity, drive, set).unwrap();
}
