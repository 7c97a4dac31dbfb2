//! Federated, permission-gated file delivery.
//!
//! A sender's [`Outbox`] checks grants and either delivers immediately or
//! queues per-recipient work on a [`transit_queue::RetryQueue`]. A
//! recipient's [`Inbox`] stages envelopes and later applies them through
//! the [`TransitCorrelator`], which matches files across nodes by global
//! transit id. [`TransitRuntime`] runs both drains on timers.

pub mod config;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod file;
pub mod inbox;
pub mod node;
pub mod outbox;
pub mod permission;
pub mod runtime;
pub mod storage;
pub mod tracker;
pub mod transport;
pub mod types;

pub use config::{TransitConfig, INBOX_QUEUE, OUTBOX_QUEUE};
pub use correlator::{CommitOutcome, Resolution, TransitCorrelator};
pub use envelope::{TransferEnvelope, TransferInstruction};
pub use error::{StorageError, TransitError, TransportError};
pub use file::{FileMetadata, FileRecord, ReferencedFile, StoredFile, Thumbnail};
pub use inbox::{Inbox, InboxEntry, InboxOutcome, InboxReport, RejectReason};
pub use node::TransitNode;
pub use outbox::{Outbox, OutboxItem, OutboxReport, SendResult};
pub use permission::{PermissionGate, StoragePermissionGate};
pub use runtime::{RuntimeChannels, RuntimeCommand, RuntimeHandle, TransitEvent, TransitRuntime};
pub use storage::{DriveStorage, MemoryDriveStorage};
pub use tracker::{StatusChange, TransferRecord, TransferTracker};
pub use transport::loopback::LoopbackNetwork;
pub use transport::{DeliveryMode, PeerResponse, PeerTransport};
pub use types::{
    now_ms, Capability, DriveId, FileId, FileRef, GlobalTransitId, Identity, PermissionSet,
    SendSchedule, TransferId, TransferStatus, TransitOptions, VersionTag,
};
