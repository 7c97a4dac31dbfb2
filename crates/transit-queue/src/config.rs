use std::time::Duration;

use crate::backoff::{Backoff, DEFAULT_BASE, DEFAULT_MAX};

/// Configuration for a [`RetryQueue`](crate::RetryQueue).
///
/// ```rust
/// use std::time::Duration;
/// use transit_queue::QueueConfig;
///
/// let config = QueueConfig::new("outbox")
///     .backoff_base(Duration::from_secs(30))
///     .backoff_max(Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Logical queue name, used in logs and to partition a shared store.
    pub(crate) name: String,
    pub(crate) backoff_base: Duration,
    pub(crate) backoff_max: Duration,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backoff_base: DEFAULT_BASE,
            backoff_max: DEFAULT_MAX,
        }
    }

    /// Delay after the first lease (default: 60 s). Doubles per lease.
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Upper bound for a single delay (default: 24 h).
    pub fn backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new("default")
    }
}
