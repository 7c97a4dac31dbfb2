/// The transit runtime event loop.
///
/// A single async task that owns the schedule and multiplexes over
/// application commands and timers. No lock is held across an await.
use tokio::sync::mpsc;

use crate::config::{INBOX_QUEUE, OUTBOX_QUEUE};
use crate::node::TransitNode;
use crate::tracker::StatusChange;
use crate::types::now_ms;

use super::{RuntimeCommand, TransitEvent};

/// `tokio::time::interval` rejects a zero period.
const MIN_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1);

pub(super) async fn runtime_loop(
    node: TransitNode,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    status_tx: mpsc::Sender<StatusChange>,
    event_tx: mpsc::Sender<TransitEvent>,
) {
    let config = node.config().clone();

    // ── Timers ──────────────────────────────────────────────────────
    let mut outbox_tick = tokio::time::interval(config.outbox_interval.max(MIN_INTERVAL));
    let mut inbox_tick = tokio::time::interval(config.inbox_interval.max(MIN_INTERVAL));
    let mut recovery_tick = tokio::time::interval(config.recovery_interval.max(MIN_INTERVAL));

    // Skip the immediate first tick on all intervals
    outbox_tick.tick().await;
    inbox_tick.tick().await;
    recovery_tick.tick().await;

    tracing::info!("runtime[{}]: started", node.identity());

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RuntimeCommand::ProcessNow { reply }) => {
                        drain_outbox(&node, &status_tx, &event_tx).await;
                        drain_inbox(&node, &event_tx).await;
                        let _ = reply.send(());
                    }
                    Some(RuntimeCommand::RecoverNow { reply }) => {
                        recover(&node, &event_tx);
                        let _ = reply.send(());
                    }
                    Some(RuntimeCommand::Shutdown) | None => break,
                }
            }

            _ = outbox_tick.tick() => {
                drain_outbox(&node, &status_tx, &event_tx).await;
            }

            _ = inbox_tick.tick() => {
                drain_inbox(&node, &event_tx).await;
            }

            _ = recovery_tick.tick() => {
                recover(&node, &event_tx);
            }
        }
    }

    tracing::info!("runtime[{}]: stopped", node.identity());
}

/// Non-blocking emit: a full channel drops the event rather than stalling the schedule.
fn emit<T>(tx: &mpsc::Sender<T>, value: T, what: &str) {
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(value) {
        tracing::warn!("runtime: {what} channel full, event dropped");
    }
}

async fn drain_outbox(
    node: &TransitNode,
    status_tx: &mpsc::Sender<StatusChange>,
    event_tx: &mpsc::Sender<TransitEvent>,
) {
    match node.process_outbox().await {
        Ok(report) if report.attempted > 0 => {
            for change in &report.changes {
                emit(status_tx, change.clone(), "status");
            }
            emit(event_tx, TransitEvent::OutboxProcessed(report), "event");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!("runtime: process_outbox failed: {e}");
            emit(
                event_tx,
                TransitEvent::Error {
                    description: format!("process_outbox: {e}"),
                },
                "event",
            );
        }
    }
}

async fn drain_inbox(node: &TransitNode, event_tx: &mpsc::Sender<TransitEvent>) {
    match node.process_inbox().await {
        Ok(report) if !report.is_empty() => {
            emit(event_tx, TransitEvent::InboxProcessed(report), "event");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!("runtime: process_inbox failed: {e}");
            emit(
                event_tx,
                TransitEvent::Error {
                    description: format!("process_inbox: {e}"),
                },
                "event",
            );
        }
    }
}

fn recover(node: &TransitNode, event_tx: &mpsc::Sender<TransitEvent>) {
    let threshold = u64::try_from(node.config().dead_lease_threshold.as_millis()).unwrap_or(u64::MAX);
    let older_than = now_ms().saturating_sub(threshold);
    match node.recover_dead(older_than) {
        Ok((outbox, inbox)) => {
            for (queue, count) in [(OUTBOX_QUEUE, outbox), (INBOX_QUEUE, inbox)] {
                if count > 0 {
                    emit(
                        event_tx,
                        TransitEvent::LeasesRecovered {
                            queue: queue.to_string(),
                            count,
                        },
                        "event",
                    );
                }
            }
        }
        Err(e) => {
            tracing::error!("runtime: recover_dead failed: {e}");
            emit(
                event_tx,
                TransitEvent::Error {
                    description: format!("recover_dead: {e}"),
                },
                "event",
            );
        }
    }
}
