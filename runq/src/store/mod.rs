//! Ordered-store backends.
//!
//! Every operation that changes admission state (queue contents, in-flight
//! sets, visibility deadlines, parent-queue scores) is a single "script":
//! one call that the backend executes atomically. Callers precompute every
//! key with [`crate::keys::KeyProducer`] and hand them over in the script
//! request, so backends never derive names themselves.

use async_trait::async_trait;

use crate::concurrency::QueueCapacities;
use crate::keys::QueueKeys;
use crate::lease::InFlightRecord;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryRunQueueStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisRunQueueStore;

/// Keys shared by every message-level script.
#[derive(Clone, Debug)]
pub struct MessageKeys {
    pub message: String,
    pub visibility: String,
    pub deliveries: String,
}

/// Store a message and index its queue under the parents. A message that is
/// already in flight only has its payload replaced; it becomes visible again
/// through nack or visibility expiry.
#[derive(Clone, Debug)]
pub struct EnqueueScript {
    pub keys: QueueKeys,
    pub message_keys: MessageKeys,
    pub message_id: String,
    pub payload: String,
    pub score: i64,
    /// Written to the env limit key only when it holds no value yet.
    pub env_limit_seed: Option<u32>,
}

/// Pop the oldest admissible message of one queue, if both concurrency
/// limits allow it.
#[derive(Clone, Debug)]
pub struct DequeueScript {
    pub keys: QueueKeys,
    pub message_key_prefix: String,
    pub visibility_key: String,
    pub deliveries_key: String,
    pub default_env_limit: u32,
    pub now: i64,
    pub visible_until: i64,
}

/// A message popped by [`RunQueueStore::dequeue`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredDelivery {
    pub message_id: String,
    pub payload: String,
    pub attempt: u32,
}

/// Delete a message and release its concurrency slots.
#[derive(Clone, Debug)]
pub struct AckScript {
    pub keys: QueueKeys,
    pub message_keys: MessageKeys,
    pub message_id: String,
}

/// Release a message's slots and put it back in its queue at `score`.
#[derive(Clone, Debug)]
pub struct NackScript {
    pub keys: QueueKeys,
    pub message_keys: MessageKeys,
    pub message_id: String,
    pub score: i64,
    /// When set, the nack only applies if the visibility deadline is still
    /// at or before this instant.
    pub expired_at: Option<i64>,
}

/// One queue to report on in a batched stats read.
#[derive(Clone, Debug)]
pub struct QueueStatsRequest {
    pub keys: QueueKeys,
    pub default_env_limit: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueueStats {
    /// Messages waiting in the queue (in-flight messages excluded).
    pub size: u64,
    pub capacities: QueueCapacities,
}

/// Atomic primitives over an ordered store.
#[async_trait]
pub trait RunQueueStore: Send + Sync {
    async fn enqueue(&self, script: &EnqueueScript) -> anyhow::Result<()>;

    /// Returns `None` when the queue is empty, not yet due, or capped.
    async fn dequeue(&self, script: &DequeueScript) -> anyhow::Result<Option<StoredDelivery>>;

    /// Returns whether the message existed.
    async fn acknowledge(&self, script: &AckScript) -> anyhow::Result<bool>;

    /// Returns whether the message was requeued.
    async fn nack(&self, script: &NackScript) -> anyhow::Result<bool>;

    /// Move the visibility deadline of an in-flight message. No-op, returning
    /// `false`, when the message is not in flight.
    async fn extend_visibility(
        &self,
        visibility_key: &str,
        message_id: &str,
        visible_until: i64,
    ) -> anyhow::Result<bool>;

    /// Forget the visibility deadline and delivery count of a message whose
    /// payload is gone. Returns whether a deadline was removed.
    async fn discard_in_flight(
        &self,
        visibility_key: &str,
        deliveries_key: &str,
        message_id: &str,
    ) -> anyhow::Result<bool>;

    async fn in_flight(
        &self,
        visibility_key: &str,
        deliveries_key: &str,
        message_id: &str,
    ) -> anyhow::Result<Option<InFlightRecord>>;

    /// In-flight message ids whose deadline is at or before `now`.
    async fn expired(
        &self,
        visibility_key: &str,
        now: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<String>>;

    async fn read_message(&self, message_key: &str) -> anyhow::Result<Option<String>>;

    async fn get_limit(&self, key: &str) -> anyhow::Result<Option<u32>>;

    async fn set_limit(&self, key: &str, limit: u32) -> anyhow::Result<()>;

    /// Returns the number of keys removed.
    async fn remove_limit(&self, key: &str) -> anyhow::Result<u64>;

    /// Cardinality of an in-flight set.
    async fn concurrency(&self, key: &str) -> anyhow::Result<u64>;

    async fn queue_length(&self, queue_key: &str) -> anyhow::Result<u64>;

    async fn oldest_score(&self, queue_key: &str) -> anyhow::Result<Option<i64>>;

    /// Members of a parent queue ordered by score, starting at `offset`.
    async fn parent_range(
        &self,
        parent_key: &str,
        offset: usize,
        count: usize,
    ) -> anyhow::Result<Vec<(String, i64)>>;

    async fn parent_length(&self, parent_key: &str) -> anyhow::Result<u64>;

    /// Sizes and capacities for many queues in one round trip.
    async fn queue_stats(&self, requests: &[QueueStatsRequest]) -> anyhow::Result<Vec<QueueStats>>;
}
