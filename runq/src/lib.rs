//! runq - distributed run queue with fair multi-tenant dequeue.
//!
//! Runs are enqueued per environment and queue, gated by queue and
//! environment concurrency limits, and handed out either from one
//! environment's own queues or from the shared production pool, where a
//! weighted strategy keeps busy tenants from starving quiet ones.
//!
//! # Core Concepts
//!
//! - **Run queue**: [`RunQueue`] is the facade over an ordered store. Every
//!   operation that changes admission state runs as one atomic store script
//!   ([`RunQueueStore`]), in memory or on Redis.
//!
//! - **Keys**: [`KeyProducer`] derives every key the store touches from the
//!   organization, project, environment and queue of a message.
//!
//! - **Selection**: [`QueuePriorityStrategy`] picks the queue to dequeue
//!   from; [`SimpleWeightedChoiceStrategy`] favours long and old queues with
//!   headroom.
//!
//! - **In flight**: a dequeued message stays hidden until acked, nacked or
//!   its visibility deadline passes; heartbeats push the deadline out and the
//!   reclaimer requeues whatever expired.
//!
//! - **Consumer**: [`consumer::DevQueueConsumer`] drives one worker
//!   connection, dispatching runs to the background workers it registered.
//!
//! # Feature Flags
//!
//! - `redis` - Redis store with Lua scripts
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use runq::*;
//! use std::sync::Arc;
//!
//! let queue = RunQueue::with_store(RunQueueConfig::default(), Arc::new(InMemoryRunQueueStore::new()));
//! let env = Environment::new("env_1", EnvironmentType::Production, 10, "proj_1", "org_1");
//!
//! queue.enqueue_message(&env, MessagePayload::execute(&env, "run_1", "my-task", "task/my-task")).await?;
//! if let Some(message) = queue.dequeue_message_in_shared_queue("consumer-1").await? {
//!     queue.acknowledge_message(&message.message_id).await?;
//! }
//! ```

/// Concurrency limits and the capacities derived from them.
pub mod concurrency;

/// Run queue and consumer configuration.
pub mod config;

/// Per-connection queue consumer.
pub mod consumer;

/// Error types and message dispositions.
pub mod error;

/// Key naming for queues, limits, counters and messages.
pub mod keys;

/// In-flight records and visibility deadlines.
pub mod lease;

/// Queue message payloads and environments.
pub mod message;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Per-worker cancellation pub/sub.
pub mod pubsub;

/// The [`RunQueue`] facade.
pub mod queue;

/// Cooperative shutdown signalling.
pub mod shutdown;

/// Ordered-store backends and their atomic scripts.
pub mod store;

/// Queue selection strategies.
pub mod strategy;

/// Span and event helpers.
pub mod telemetry;

/// Batch spans for consumer iterations.
pub mod trace_batch;

pub use concurrency::*;
pub use config::*;
pub use error::*;
pub use keys::*;
pub use lease::*;
pub use message::*;
pub use pubsub::*;
pub use queue::*;
pub use shutdown::*;
pub use store::{InMemoryRunQueueStore, QueueStats, RunQueueStore};
#[cfg(feature = "redis")]
pub use store::RedisRunQueueStore;
pub use strategy::*;
pub use telemetry::{ConsumerSpan, ConsumerTracer, TracingConsumerTracer};
pub use trace_batch::TraceBatcher;
