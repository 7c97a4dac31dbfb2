/// Transit runtime: drives a [`TransitNode`] on timers.
///
/// One tokio task owns the schedule: it drains the outbox and the inbox on
/// their intervals and recovers dead leases. The application talks to it
/// through a [`RuntimeHandle`] and observes it through channels.
mod r#loop;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::TransitError;
use crate::inbox::InboxReport;
use crate::node::TransitNode;
use crate::outbox::OutboxReport;
use crate::tracker::StatusChange;
use crate::types::Identity;

// ── Commands (app → runtime) ──────────────────────────────────────────

pub enum RuntimeCommand {
    /// Drain both queues now, then reply.
    ProcessNow { reply: oneshot::Sender<()> },
    /// Recover leases older than the configured threshold now, then reply.
    RecoverNow { reply: oneshot::Sender<()> },
    Shutdown,
}

// ── Events (runtime → app) ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitEvent {
    /// A `process_outbox` pass handled at least one item.
    OutboxProcessed(OutboxReport),
    /// A `process_inbox` pass handled at least one envelope.
    InboxProcessed(InboxReport),
    LeasesRecovered { queue: String, count: usize },
    /// Non-fatal; the runtime keeps running.
    Error { description: String },
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to a running [`TransitRuntime`]. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    identity: Identity,
}

impl RuntimeHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Drain both queues without waiting for the timers.
    pub async fn process_now(&self) -> Result<(), TransitError> {
        let (reply, done) = oneshot::channel();
        self.command(RuntimeCommand::ProcessNow { reply }).await?;
        done.await.map_err(|_| shut_down())
    }

    pub async fn recover_now(&self) -> Result<(), TransitError> {
        let (reply, done) = oneshot::channel();
        self.command(RuntimeCommand::RecoverNow { reply }).await?;
        done.await.map_err(|_| shut_down())
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
    }

    async fn command(&self, cmd: RuntimeCommand) -> Result<(), TransitError> {
        self.cmd_tx.send(cmd).await.map_err(|_| shut_down())
    }
}

fn shut_down() -> TransitError {
    TransitError::Transport(crate::error::TransportError::Protocol(
        "runtime shut down".into(),
    ))
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    pub handle: RuntimeHandle,
    /// Status transitions produced by queued deliveries.
    pub status_changes: mpsc::Receiver<StatusChange>,
    pub events: mpsc::Receiver<TransitEvent>,
    /// Resolves when the loop has exited.
    pub task: tokio::task::JoinHandle<()>,
}

// ── TransitRuntime ───────────────────────────────────────────────────

pub struct TransitRuntime;

impl TransitRuntime {
    /// Spawn the event loop as a tokio task. Intervals come from the node's config.
    pub fn spawn(node: TransitNode) -> RuntimeChannels {
        let identity = node.identity().clone();
        let buffer = node.config().event_buffer.max(1);

        let (cmd_tx, cmd_rx) = mpsc::channel::<RuntimeCommand>(64);
        let (status_tx, status_rx) = mpsc::channel::<StatusChange>(buffer);
        let (event_tx, event_rx) = mpsc::channel::<TransitEvent>(buffer);

        let task = tokio::spawn(r#loop::runtime_loop(node, cmd_rx, status_tx, event_tx));

        RuntimeChannels {
            handle: RuntimeHandle { cmd_tx, identity },
            status_changes: status_rx,
            events: event_rx,
            task,
        }
    }
}
