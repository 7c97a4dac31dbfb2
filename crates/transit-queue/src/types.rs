use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Maximum length of either half of a [`QueueKey`].
pub const MAX_KEY_PART_LEN: usize = 256;

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identity of a queue item: the owner scope plus the item type.
///
/// Unique within one logical queue. Re-enqueueing an existing key
/// supersedes whatever is stored (and leased) under it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    scope: String,
    kind: String,
}

impl QueueKey {
    pub fn new(scope: impl Into<String>, kind: impl Into<String>) -> Result<Self, QueueError> {
        let scope = scope.into();
        let kind = kind.into();
        for (name, part) in [("scope", &scope), ("kind", &kind)] {
            if part.is_empty() {
                return Err(QueueError::InvalidKey {
                    reason: format!("{name} is empty"),
                });
            }
            if part.len() > MAX_KEY_PART_LEN {
                return Err(QueueError::InvalidKey {
                    reason: format!("{name} exceeds {MAX_KEY_PART_LEN} bytes"),
                });
            }
        }
        Ok(Self { scope, kind })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.kind)
    }
}

/// Marks a batch of items as in flight.
///
/// Shared by every item leased in one `pop`. It says "leased by that pop",
/// not "owned by worker X".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(uuid::Uuid);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        uuid::Uuid::from_slice(bytes).ok().map(Self)
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One row of a retry queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub key: QueueKey,
    /// Opaque to the queue.
    pub payload: Vec<u8>,
    /// Number of times this item has been leased since it was last upserted.
    pub run_count: u32,
    /// Unix ms; the item is eligible once this is reached and it is not leased.
    pub next_run_at: u64,
    /// Unix ms of the most recent lease grant.
    pub last_run_at: Option<u64>,
    pub lease: Option<LeaseToken>,
    /// Unix ms of the (latest) upsert. FIFO order.
    pub created_at: u64,
    /// Not leased while an item under this key is still in the same queue.
    pub depends_on: Option<QueueKey>,
}

impl QueueItem {
    pub fn is_leased(&self) -> bool {
        self.lease.is_some()
    }

    /// Available for a new lease at `now`.
    pub fn is_available(&self, now: u64) -> bool {
        self.lease.is_none() && self.next_run_at <= now
    }

    /// Leased under `token` specifically.
    pub fn is_held_by(&self, token: &LeaseToken) -> bool {
        self.lease.as_ref() == Some(token)
    }
}

/// The result of a `pop`: the token and the items leased under it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub token: LeaseToken,
    pub items: Vec<QueueItem>,
}

impl Lease {
    pub fn empty() -> Self {
        Self {
            token: LeaseToken::generate(),
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> Vec<QueueKey> {
        self.items.iter().map(|i| i.key.clone()).collect()
    }
}

/// Point-in-time summary of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total: usize,
    pub leased: usize,
    /// Earliest `next_run_at` among unleased items. `None` if there are none.
    pub next_run_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(lease: Option<LeaseToken>, next_run_at: u64) -> QueueItem {
        QueueItem {
            key: QueueKey::new("drive", "file").unwrap(),
            payload: vec![],
            run_count: 0,
            next_run_at,
            last_run_at: None,
            lease,
            created_at: 0,
            depends_on: None,
        }
    }

    #[test]
    fn key_rejects_empty_parts() {
        assert!(matches!(
            QueueKey::new("", "x"),
            Err(QueueError::InvalidKey { .. })
        ));
        assert!(QueueKey::new("x", "").is_err());
        assert!(QueueKey::new("x".repeat(MAX_KEY_PART_LEN + 1), "y").is_err());
        assert_eq!(QueueKey::new("a", "b").unwrap().to_string(), "a/b");
    }

    #[test]
    fn availability_requires_no_lease_and_due_time() {
        assert!(item(None, 100).is_available(100));
        assert!(!item(None, 101).is_available(100));
        assert!(!item(Some(LeaseToken::generate()), 0).is_available(100));
    }

    #[test]
    fn lease_token_bytes_roundtrip() {
        let token = LeaseToken::generate();
        assert_eq!(LeaseToken::from_slice(token.as_bytes()), Some(token));
        assert_eq!(LeaseToken::from_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn held_by_matches_only_the_same_token() {
        let token = LeaseToken::generate();
        let leased = item(Some(token), 0);
        assert!(leased.is_held_by(&token));
        assert!(!leased.is_held_by(&LeaseToken::generate()));
    }
}
