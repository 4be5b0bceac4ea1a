use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the run queue and its store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunQueueConfig {
    /// Namespace prepended to every key by shared stores (e.g. "rq").
    pub key_prefix: String,
    /// Environment concurrency limit used when none has been stored.
    pub default_env_concurrency: u32,
    /// Seconds a dequeued message stays hidden before it is redelivered.
    pub visibility_timeout_secs: u64,
    /// Page size when sampling the shared pool.
    pub queue_selection_count: usize,
    /// Page size when sampling a single environment's queues.
    pub env_queue_selection_count: usize,
    /// Interval between visibility reclaim sweeps, in milliseconds.
    pub reclaim_interval_ms: u64,
}

impl RunQueueConfig {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            ..Self::default()
        }
    }

    pub fn with_default_env_concurrency(mut self, limit: u32) -> Self {
        self.default_env_concurrency = limit;
        self
    }

    pub fn with_visibility_timeout(mut self, secs: u64) -> Self {
        self.visibility_timeout_secs = secs;
        self
    }

    pub fn with_queue_selection_count(mut self, count: usize) -> Self {
        self.queue_selection_count = count;
        self
    }

    pub fn with_env_queue_selection_count(mut self, count: usize) -> Self {
        self.env_queue_selection_count = count;
        self
    }

    pub fn with_reclaim_interval(mut self, ms: u64) -> Self {
        self.reclaim_interval_ms = ms;
        self
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}

impl Default for RunQueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rq".to_string(),
            default_env_concurrency: 10,
            visibility_timeout_secs: 300,
            queue_selection_count: 36,
            env_queue_selection_count: 12,
            reclaim_interval_ms: 1_000,
        }
    }
}

/// Configuration for a per-connection queue consumer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConsumerConfig {
    /// Iterations grouped under one trace span before it is rotated.
    pub maximum_items_per_trace: u32,
    /// Seconds after which a trace span is rotated regardless of count.
    pub trace_timeout_secs: u64,
    /// Delay before polling again after an empty dequeue.
    pub empty_queue_delay_ms: u64,
    /// Delay before polling again after the run queue failed. Kept shorter
    /// than `empty_queue_delay_ms`.
    pub error_delay_ms: u64,
    /// Delay before polling again after a message was handled.
    pub message_delay_ms: u64,
    /// Delay before polling again after a queue record was missing.
    pub queue_missing_delay_ms: u64,
    /// Visibility extension applied by run heartbeats, in seconds.
    pub heartbeat_secs: u64,
    /// Address of the connected worker, stored on the environment session.
    pub ip_address: Option<String>,
}

impl QueueConsumerConfig {
    pub fn with_maximum_items_per_trace(mut self, items: u32) -> Self {
        self.maximum_items_per_trace = items;
        self
    }

    pub fn with_trace_timeout(mut self, secs: u64) -> Self {
        self.trace_timeout_secs = secs;
        self
    }

    pub fn with_empty_queue_delay(mut self, ms: u64) -> Self {
        self.empty_queue_delay_ms = ms;
        self
    }

    pub fn with_error_delay(mut self, ms: u64) -> Self {
        self.error_delay_ms = ms;
        self
    }

    pub fn with_message_delay(mut self, ms: u64) -> Self {
        self.message_delay_ms = ms;
        self
    }

    pub fn with_queue_missing_delay(mut self, ms: u64) -> Self {
        self.queue_missing_delay_ms = ms;
        self
    }

    pub fn with_heartbeat(mut self, secs: u64) -> Self {
        self.heartbeat_secs = secs;
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn empty_queue_delay(&self) -> Duration {
        Duration::from_millis(self.empty_queue_delay_ms)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_millis(self.error_delay_ms)
    }

    pub fn message_delay(&self) -> Duration {
        Duration::from_millis(self.message_delay_ms)
    }

    pub fn queue_missing_delay(&self) -> Duration {
        Duration::from_millis(self.queue_missing_delay_ms)
    }

    pub fn trace_timeout(&self) -> Duration {
        Duration::from_secs(self.trace_timeout_secs)
    }
}

impl Default for QueueConsumerConfig {
    fn default() -> Self {
        Self {
            maximum_items_per_trace: 1_000,
            trace_timeout_secs: 60,
            empty_queue_delay_ms: 1_000,
            error_delay_ms: 250,
            message_delay_ms: 100,
            queue_missing_delay_ms: 1_000,
            heartbeat_secs: 60,
            ip_address: None,
        }
    }
}
