use std::time::Duration;

use transit_queue::QueueConfig;

/// Name of the sender-side logical queue.
pub const OUTBOX_QUEUE: &str = "outbox";
/// Name of the recipient-side logical queue.
pub const INBOX_QUEUE: &str = "inbox";

/// Configuration for a [`TransitNode`](crate::TransitNode) and its runtime.
#[derive(Debug, Clone)]
pub struct TransitConfig {
    /// Items leased per `process_outbox` call.
    pub outbox_batch_size: usize,
    /// Envelopes leased per `process_inbox` call.
    pub inbox_batch_size: usize,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Leases older than this are considered dead and recovered.
    pub dead_lease_threshold: Duration,
    pub outbox_interval: Duration,
    pub inbox_interval: Duration,
    pub recovery_interval: Duration,
    /// Capacity of the runtime event channel.
    pub event_buffer: usize,
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            outbox_batch_size: 16,
            inbox_batch_size: 32,
            backoff_base: transit_queue::backoff::DEFAULT_BASE,
            backoff_max: transit_queue::backoff::DEFAULT_MAX,
            dead_lease_threshold: Duration::from_secs(10 * 60),
            outbox_interval: Duration::from_secs(5),
            inbox_interval: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(60),
            event_buffer: 256,
        }
    }
}

impl TransitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_sizes(mut self, outbox: usize, inbox: usize) -> Self {
        self.outbox_batch_size = outbox;
        self.inbox_batch_size = inbox;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn dead_lease_threshold(mut self, threshold: Duration) -> Self {
        self.dead_lease_threshold = threshold;
        self
    }

    pub fn intervals(mut self, outbox: Duration, inbox: Duration, recovery: Duration) -> Self {
        self.outbox_interval = outbox;
        self.inbox_interval = inbox;
        self.recovery_interval = recovery;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub(crate) fn queue_config(&self, name: &str) -> QueueConfig {
        QueueConfig::new(name)
            .backoff_base(self.backoff_base)
            .backoff_max(self.backoff_max)
    }
}
