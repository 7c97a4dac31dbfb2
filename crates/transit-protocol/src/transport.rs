/// Hands envelopes to remote identities.
///
/// Production transports speak HTTP to the remote host; [`loopback`]
/// routes in process for tests and single-process federations.
use serde::{Deserialize, Serialize};

use crate::envelope::TransferEnvelope;
use crate::error::TransportError;
use crate::types::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Recipient stages into its inbox and answers immediately.
    StageOnly,
    /// Recipient stages, then processes its inbox before answering.
    AwaitProcessing,
}

/// The recipient's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    AcceptedIntoInbox,
    /// Staged and already written to the target drive.
    AcceptedDirectWrite,
    AccessDenied,
    /// Irrecoverable on the recipient side; resending the same envelope will not help.
    Rejected { reason: String },
}

#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn deliver(
        &self,
        recipient: &Identity,
        envelope: &TransferEnvelope,
        mode: DeliveryMode,
    ) -> Result<PeerResponse, TransportError>;
}

// ── Loopback ────────────────────────────────────────────────────────

pub mod loopback {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::inbox::Inbox;

    #[derive(Default)]
    struct Peers {
        inboxes: HashMap<Identity, Inbox>,
        unreachable: HashSet<Identity>,
    }

    /// In-process network. Every delivery goes through the MessagePack codec.
    #[derive(Clone, Default)]
    pub struct LoopbackNetwork {
        peers: Arc<Mutex<Peers>>,
    }

    impl LoopbackNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register(&self, identity: Identity, inbox: Inbox) {
            if let Ok(mut peers) = self.peers.lock() {
                peers.inboxes.insert(identity, inbox);
            }
        }

        /// Simulate a peer going offline (or coming back).
        pub fn set_unreachable(&self, identity: &Identity, unreachable: bool) {
            if let Ok(mut peers) = self.peers.lock() {
                if unreachable {
                    peers.unreachable.insert(identity.clone());
                } else {
                    peers.unreachable.remove(identity);
                }
            }
        }

        fn route(&self, recipient: &Identity) -> Result<Inbox, TransportError> {
            let peers = self
                .peers
                .lock()
                .map_err(|_| TransportError::Protocol("loopback lock poisoned".into()))?;
            if peers.unreachable.contains(recipient) {
                return Err(TransportError::Unreachable {
                    identity: recipient.to_string(),
                });
            }
            peers
                .inboxes
                .get(recipient)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable {
                    identity: recipient.to_string(),
                })
        }
    }

    #[async_trait::async_trait]
    impl PeerTransport for LoopbackNetwork {
        async fn deliver(
            &self,
            recipient: &Identity,
            envelope: &TransferEnvelope,
            mode: DeliveryMode,
        ) -> Result<PeerResponse, TransportError> {
            let inbox = self.route(recipient)?;

            let wire = envelope
                .to_bytes()
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            let received = match TransferEnvelope::from_bytes(&wire) {
                Ok(envelope) => envelope,
                Err(e) => {
                    return Ok(PeerResponse::Rejected {
                        reason: e.to_string(),
                    })
                }
            };

            inbox
                .receive(received, mode)
                .await
                .map_err(|e| TransportError::Protocol(e.to_string()))
        }
    }
}
