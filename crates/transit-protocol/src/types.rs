use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use transit_queue::now_ms;

/// A federation participant, addressed by its domain (e.g. `frodo.dotyou.cloud`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(domain: impl Into<String>) -> Self {
        Self(domain.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            pub fn from_uuid(id: uuid::Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// A permissioned content container local to one identity.
    DriveId
);
uuid_id!(
    /// Local file id. Never shared across nodes.
    FileId
);
uuid_id!(
    /// Cross-node correlation id: sender and recipient agree a file is "the same".
    GlobalTransitId
);
uuid_id!(
    /// Unique per incoming transfer; keys the recipient's inbox.
    TransferId
);
uuid_id!(
    /// Opaque optimistic-concurrency tag, replaced on every write.
    VersionTag
);

/// A local file, addressed by drive and local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub drive: DriveId,
    pub file: FileId,
}

impl FileRef {
    pub fn new(drive: DriveId, file: FileId) -> Self {
        Self { drive, file }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.drive, self.file)
    }
}

// ── Permissions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    Read,
    Write,
    /// Post comments and reactions that reference files on the drive.
    WriteReactionsAndComments,
}

/// Capabilities one remote identity holds on one drive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(BTreeSet<Capability>);

impl PermissionSet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of(capabilities: &[Capability]) -> Self {
        Self(capabilities.iter().copied().collect())
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    /// Whether `capability` is granted. Full write implies comment/reaction write.
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::WriteReactionsAndComments => {
                self.0.contains(&capability) || self.0.contains(&Capability::Write)
            }
            other => self.0.contains(&other),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Transfer status ─────────────────────────────────────────────────

/// Per-recipient outcome of a send.
///
/// Success path: `TransferKeyCreated → DeliveredToInbox → DeliveredToTargetDrive`.
/// `RecipientReturnedAccessDenied` and `TotalRejectionClientShouldRetry` are
/// terminal; a new `send` starts a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    TransferKeyCreated,
    DeliveredToInbox,
    DeliveredToTargetDrive,
    RecipientReturnedAccessDenied,
    TotalRejectionClientShouldRetry,
}

impl TransferStatus {
    pub fn is_delivered(self) -> bool {
        matches!(
            self,
            TransferStatus::DeliveredToInbox | TransferStatus::DeliveredToTargetDrive
        )
    }

    /// No further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::DeliveredToTargetDrive
                | TransferStatus::RecipientReturnedAccessDenied
                | TransferStatus::TotalRejectionClientShouldRetry
        )
    }

    /// Forward-only transitions.
    pub fn can_advance_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match self {
            TransferKeyCreated => next != TransferKeyCreated,
            DeliveredToInbox => next == DeliveredToTargetDrive,
            _ => false,
        }
    }
}

// ── Send options ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendSchedule {
    /// Deliver now and wait for the recipient to process it.
    #[default]
    SendNowAwaitResponse,
    /// Enqueue; `process_outbox` delivers later.
    Queued,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitOptions {
    pub schedule: SendSchedule,
    /// Delete the sender's copy once every recipient has it.
    pub is_transient: bool,
    pub use_global_transit_id: bool,
    /// Drive on the recipient side. Defaults to the file's own drive id.
    pub remote_target_drive: Option<DriveId>,
}

impl TransitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued() -> Self {
        Self::new().schedule(SendSchedule::Queued)
    }

    pub fn schedule(mut self, schedule: SendSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn transient(mut self, is_transient: bool) -> Self {
        self.is_transient = is_transient;
        self
    }

    pub fn global_transit_id(mut self, enabled: bool) -> Self {
        self.use_global_transit_id = enabled;
        self
    }

    pub fn target_drive(mut self, drive: DriveId) -> Self {
        self.remote_target_drive = Some(drive);
        self
    }
}
