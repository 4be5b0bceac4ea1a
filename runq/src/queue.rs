use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::RunQueueConfig;
use crate::keys::KeyProducer;
use crate::lease::{now_ms, visibility_deadline, InFlightRecord, ReclaimOutcome};
use crate::message::{DequeuedMessage, Environment, MessagePayload};
use crate::shutdown::ShutdownToken;
use crate::store::{
    AckScript, DequeueScript, EnqueueScript, MessageKeys, NackScript, QueueStatsRequest,
    RunQueueStore,
};
use crate::strategy::{
    QueueCandidate, QueueChoice, QueuePriorityStrategy, SimpleWeightedChoiceStrategy,
};
use crate::telemetry;

const SHARED_DETAILS_SELECTION_ID: &str = "getSharedQueueDetails";
const RECLAIM_BATCH: usize = 100;

/// Diagnostic view of the shared pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SharedQueueDetails {
    pub selection_id: String,
    /// Queues currently indexed in the shared pool.
    pub queue_count: u64,
    /// Candidates of the first selection window.
    pub queues: Vec<QueueCandidate>,
    /// What the strategy would pick right now.
    pub queue_choice: QueueChoice,
}

/// The run queue: per-environment private queues, the shared production
/// pool, concurrency limits and the in-flight bookkeeping around them.
pub struct RunQueue {
    config: RunQueueConfig,
    keys: KeyProducer,
    store: Arc<dyn RunQueueStore>,
    queue_priority_strategy: Arc<dyn QueuePriorityStrategy>,
    env_queue_priority_strategy: Arc<dyn QueuePriorityStrategy>,
}

impl std::fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RunQueue {
    pub fn new(
        config: RunQueueConfig,
        store: Arc<dyn RunQueueStore>,
        queue_priority_strategy: Arc<dyn QueuePriorityStrategy>,
        env_queue_priority_strategy: Arc<dyn QueuePriorityStrategy>,
    ) -> Self {
        Self {
            config,
            keys: KeyProducer::new(),
            store,
            queue_priority_strategy,
            env_queue_priority_strategy,
        }
    }

    /// Run queue using [`SimpleWeightedChoiceStrategy`] for both the shared
    /// pool and environment queues, sized from the config.
    pub fn with_store(config: RunQueueConfig, store: Arc<dyn RunQueueStore>) -> Self {
        let shared = Arc::new(SimpleWeightedChoiceStrategy::new(config.queue_selection_count));
        let env = Arc::new(SimpleWeightedChoiceStrategy::new(
            config.env_queue_selection_count,
        ));
        Self::new(config, store, shared, env)
    }

    pub fn config(&self) -> &RunQueueConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyProducer {
        &self.keys
    }

    fn message_keys(&self, message_id: &str) -> MessageKeys {
        MessageKeys {
            message: self.keys.message_key(message_id),
            visibility: self.keys.visibility_key().to_string(),
            deliveries: self.keys.deliveries_key().to_string(),
        }
    }

    /// Store a message and make it visible in its environment queue and, for
    /// production environments, in the shared pool. Re-enqueueing an id
    /// moves it to the new score.
    pub async fn enqueue_message(
        &self,
        env: &Environment,
        message: MessagePayload,
    ) -> anyhow::Result<()> {
        let queue_keys = self.keys.keys_for_message(&message);
        let span = telemetry::enqueue_span(&queue_keys.queue, message.message_id());

        async {
            let script = EnqueueScript {
                message_keys: self.message_keys(message.message_id()),
                message_id: message.message_id().to_string(),
                payload: message.to_json()?,
                score: message.timestamp,
                env_limit_seed: Some(env.maximum_concurrency_limit),
                keys: queue_keys,
            };
            self.store.enqueue(&script).await?;

            telemetry::record_enqueued(&script.keys.queue, message.environment_type.as_str());
            anyhow::Ok(())
        }
        .instrument(span)
        .await
    }

    /// Pop the oldest admissible message among the environment's own queues.
    pub async fn dequeue_message_in_env(
        &self,
        env: &Environment,
    ) -> anyhow::Result<Option<DequeuedMessage>> {
        let parent = self.keys.env_parent_key(env);
        let span = telemetry::dequeue_span("env", &env.id);

        self.dequeue_from_parent(
            "env",
            &parent,
            &env.id,
            self.env_queue_priority_strategy.as_ref(),
        )
        .instrument(span)
        .await
    }

    /// Pop a message from the shared pool, choosing the queue with the
    /// configured strategy.
    pub async fn dequeue_message_in_shared_queue(
        &self,
        consumer_id: &str,
    ) -> anyhow::Result<Option<DequeuedMessage>> {
        let span = telemetry::dequeue_span("shared", consumer_id);

        self.dequeue_from_parent(
            "shared",
            self.keys.shared_queue_key(),
            consumer_id,
            self.queue_priority_strategy.as_ref(),
        )
        .instrument(span)
        .await
    }

    async fn dequeue_from_parent(
        &self,
        path: &'static str,
        parent: &str,
        consumer_id: &str,
        strategy: &dyn QueuePriorityStrategy,
    ) -> anyhow::Result<Option<DequeuedMessage>> {
        let started = Instant::now();
        let now = now_ms();
        let range = strategy.next_candidate_selection(parent, consumer_id);
        let mut candidates = self.candidates(parent, range.offset, range.count, now).await?;

        for _ in 0..=candidates.len() {
            let queue = match strategy.choose_queue(&candidates, parent, consumer_id) {
                QueueChoice::Abort => return Ok(None),
                QueueChoice::Queue(queue) => queue,
            };

            if let Some(message) = self.dequeue_from_queue(&queue, now).await? {
                tracing::Span::current().record("message_id", message.message_id.as_str());
                telemetry::record_dequeued(path, &queue, &message.message_id, started.elapsed());
                return Ok(Some(message));
            }

            // Rejected by admission: treat as capped for the rest of the pass.
            for candidate in candidates.iter_mut().filter(|c| c.queue == queue) {
                candidate.capacities.queue.current = candidate.capacities.queue.limit;
            }
        }

        Ok(None)
    }

    async fn dequeue_from_queue(
        &self,
        queue: &str,
        now: i64,
    ) -> anyhow::Result<Option<DequeuedMessage>> {
        let keys = match self.keys.keys_for_queue(queue, true) {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(queue = %queue, error = %err, "skipping unparseable queue");
                return Ok(None);
            }
        };

        let visible_until = visibility_deadline(now, self.config.visibility_timeout_secs);
        let script = DequeueScript {
            message_key_prefix: self.keys.message_key_prefix().to_string(),
            visibility_key: self.keys.visibility_key().to_string(),
            deliveries_key: self.keys.deliveries_key().to_string(),
            default_env_limit: self.config.default_env_concurrency,
            now,
            visible_until,
            keys,
        };

        let Some(delivery) = self.store.dequeue(&script).await? else {
            return Ok(None);
        };

        match MessagePayload::from_json(&delivery.payload) {
            Ok(message) => Ok(Some(DequeuedMessage {
                message_id: delivery.message_id,
                queue: queue.to_string(),
                message,
                attempt: delivery.attempt,
                visible_until,
            })),
            Err(err) => {
                tracing::error!(
                    message_id = %delivery.message_id,
                    queue = %queue,
                    error = %err,
                    "dropping message with unreadable payload"
                );
                let ack = AckScript {
                    keys: script.keys,
                    message_keys: self.message_keys(&delivery.message_id),
                    message_id: delivery.message_id,
                };
                self.store.acknowledge(&ack).await?;
                Ok(None)
            }
        }
    }

    async fn candidates(
        &self,
        parent: &str,
        offset: usize,
        count: usize,
        now: i64,
    ) -> anyhow::Result<Vec<QueueCandidate>> {
        let members = self.store.parent_range(parent, offset, count).await?;

        let mut queues = Vec::with_capacity(members.len());
        let mut requests = Vec::with_capacity(members.len());
        for (queue, score) in members {
            match self.keys.keys_for_queue(&queue, false) {
                Ok(keys) => {
                    requests.push(QueueStatsRequest {
                        keys,
                        default_env_limit: self.config.default_env_concurrency,
                    });
                    queues.push((queue, score));
                }
                Err(err) => {
                    tracing::warn!(parent = %parent, queue = %queue, error = %err, "ignoring malformed parent member");
                }
            }
        }

        let stats = self.store.queue_stats(&requests).await?;
        Ok(queues
            .into_iter()
            .zip(stats)
            .map(|((queue, score), stats)| QueueCandidate {
                queue,
                score,
                age: (now - score).max(0),
                size: stats.size,
                capacities: stats.capacities,
            })
            .collect())
    }

    async fn read_message(&self, message_id: &str) -> anyhow::Result<Option<MessagePayload>> {
        let raw = self
            .store
            .read_message(&self.keys.message_key(message_id))
            .await?;
        match raw {
            Some(raw) => Ok(Some(MessagePayload::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delete a message for good and release its concurrency slots.
    /// Acknowledging an unknown or already acknowledged id is a no-op.
    pub async fn acknowledge_message(&self, message_id: &str) -> anyhow::Result<bool> {
        let span = telemetry::ack_span(message_id);

        async {
            let Some(message) = self.read_message(message_id).await? else {
                tracing::debug!(message_id = %message_id, "ack of unknown message ignored");
                return Ok(false);
            };

            let script = AckScript {
                keys: self.keys.keys_for_message(&message),
                message_keys: self.message_keys(message_id),
                message_id: message_id.to_string(),
            };
            let existed = self.store.acknowledge(&script).await?;
            if existed {
                telemetry::record_acknowledged(message_id);
            }
            anyhow::Ok(existed)
        }
        .instrument(span)
        .await
    }

    /// Release a message's slots and put it back in its queue, scored now.
    pub async fn nack_message(&self, message_id: &str) -> anyhow::Result<bool> {
        let span = telemetry::nack_span(message_id);

        async {
            let requeued = self.requeue(message_id, now_ms(), None).await?;
            if requeued {
                telemetry::record_nacked(message_id, "nack");
            }
            anyhow::Ok(requeued)
        }
        .instrument(span)
        .await
    }

    async fn requeue(
        &self,
        message_id: &str,
        score: i64,
        expired_at: Option<i64>,
    ) -> anyhow::Result<bool> {
        let Some(message) = self.read_message(message_id).await? else {
            return Ok(false);
        };

        let script = NackScript {
            keys: self.keys.keys_for_message(&message),
            message_keys: self.message_keys(message_id),
            message_id: message_id.to_string(),
            score,
            expired_at,
        };
        self.store.nack(&script).await
    }

    /// Push the visibility deadline of an in-flight message to now + `seconds`.
    /// Returns `false`, without error, when the message is no longer in flight.
    pub async fn heartbeat_message(&self, message_id: &str, seconds: u64) -> anyhow::Result<bool> {
        let span = telemetry::heartbeat_span(message_id, seconds);

        async {
            let deadline = visibility_deadline(now_ms(), seconds);
            let extended = self
                .store
                .extend_visibility(self.keys.visibility_key(), message_id, deadline)
                .await?;
            if !extended {
                tracing::debug!(message_id = %message_id, "heartbeat for message not in flight");
            }
            anyhow::Ok(extended)
        }
        .instrument(span)
        .await
    }

    /// In-flight state of a message, if it is currently dequeued.
    pub async fn in_flight(&self, message_id: &str) -> anyhow::Result<Option<InFlightRecord>> {
        self.store
            .in_flight(
                self.keys.visibility_key(),
                self.keys.deliveries_key(),
                message_id,
            )
            .await
    }

    /// Requeue every in-flight message whose deadline passed.
    pub async fn reclaim_expired_messages(&self) -> anyhow::Result<u64> {
        self.reclaim_expired_messages_at(now_ms()).await
    }

    /// [`RunQueue::reclaim_expired_messages`] as of `now`, in milliseconds.
    pub async fn reclaim_expired_messages_at(&self, now: i64) -> anyhow::Result<u64> {
        let mut reclaimed = 0;
        loop {
            let expired = self
                .store
                .expired(self.keys.visibility_key(), now, RECLAIM_BATCH)
                .await?;
            let batch_len = expired.len();

            let mut settled = 0;
            for message_id in expired {
                match self.reclaim(&message_id, now).await? {
                    ReclaimOutcome::Requeued => {
                        telemetry::record_visibility_expired(&message_id);
                        reclaimed += 1;
                    }
                    ReclaimOutcome::Settled => settled += 1,
                }
            }

            // A full batch of settled entries would be returned again; stop.
            if batch_len < RECLAIM_BATCH || settled == batch_len {
                return Ok(reclaimed);
            }
        }
    }

    async fn reclaim(&self, message_id: &str, now: i64) -> anyhow::Result<ReclaimOutcome> {
        if self.requeue(message_id, now, Some(now)).await? {
            return Ok(ReclaimOutcome::Requeued);
        }

        // Payload gone but the deadline remained.
        if self.read_message(message_id).await?.is_none()
            && self
                .store
                .discard_in_flight(
                    self.keys.visibility_key(),
                    self.keys.deliveries_key(),
                    message_id,
                )
                .await?
        {
            tracing::warn!(message_id = %message_id, "discarded in-flight entry without payload");
        }
        Ok(ReclaimOutcome::Settled)
    }

    /// Sweep expired messages every `reclaim_interval_ms` until `shutdown`.
    pub fn spawn_visibility_reclaimer(self: &Arc<Self>, shutdown: ShutdownToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let interval = self.config.reclaim_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("visibility reclaimer shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = queue.reclaim_expired_messages().await {
                            tracing::warn!("visibility reclaimer error: {err:#}");
                        }
                    }
                }
            }
        })
    }

    pub async fn get_queue_concurrency_limit(
        &self,
        env: &Environment,
        queue: &str,
    ) -> anyhow::Result<Option<u32>> {
        self.store
            .get_limit(&self.keys.queue_concurrency_limit_key(env, queue))
            .await
    }

    pub async fn update_queue_concurrency_limits(
        &self,
        env: &Environment,
        queue: &str,
        concurrency: u32,
    ) -> anyhow::Result<()> {
        self.store
            .set_limit(&self.keys.queue_concurrency_limit_key(env, queue), concurrency)
            .await
    }

    /// Clear the queue override so the environment limit applies again.
    pub async fn remove_queue_concurrency_limits(
        &self,
        env: &Environment,
        queue: &str,
    ) -> anyhow::Result<u64> {
        self.store
            .remove_limit(&self.keys.queue_concurrency_limit_key(env, queue))
            .await
    }

    /// Stored environment limit, or the configured default.
    pub async fn get_env_concurrency_limit(&self, env: &Environment) -> anyhow::Result<u32> {
        Ok(self
            .store
            .get_limit(&self.keys.env_concurrency_limit_key(env))
            .await?
            .unwrap_or(self.config.default_env_concurrency))
    }

    /// Store `env.maximum_concurrency_limit` as the environment limit.
    pub async fn update_env_concurrency_limits(&self, env: &Environment) -> anyhow::Result<()> {
        self.store
            .set_limit(
                &self.keys.env_concurrency_limit_key(env),
                env.maximum_concurrency_limit,
            )
            .await
    }

    pub async fn current_concurrency_of_queue(
        &self,
        env: &Environment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> anyhow::Result<u64> {
        let keys = self
            .keys
            .keys_for_queue(&self.keys.queue_key(env, queue, concurrency_key), false)?;
        self.store.concurrency(&keys.queue_current).await
    }

    pub async fn current_concurrency_of_env(&self, env: &Environment) -> anyhow::Result<u64> {
        self.store
            .concurrency(&self.keys.env_current_concurrency_key(env))
            .await
    }

    /// Messages waiting in a queue; in-flight messages are not counted.
    pub async fn length_of_queue(
        &self,
        env: &Environment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> anyhow::Result<u64> {
        self.store
            .queue_length(&self.keys.queue_key(env, queue, concurrency_key))
            .await
    }

    /// Timestamp of the oldest waiting message in a queue.
    pub async fn oldest_message_in_queue(
        &self,
        env: &Environment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> anyhow::Result<Option<i64>> {
        self.store
            .oldest_score(&self.keys.queue_key(env, queue, concurrency_key))
            .await
    }

    pub async fn get_shared_queue_details(&self) -> anyhow::Result<SharedQueueDetails> {
        let parent = self.keys.shared_queue_key();
        let strategy = self.queue_priority_strategy.as_ref();

        let range = strategy.next_candidate_selection(parent, SHARED_DETAILS_SELECTION_ID);
        let queues = self
            .candidates(parent, range.offset, range.count, now_ms())
            .await?;
        let queue_choice = strategy.choose_queue(&queues, parent, SHARED_DETAILS_SELECTION_ID);

        Ok(SharedQueueDetails {
            selection_id: SHARED_DETAILS_SELECTION_ID.to_string(),
            queue_count: self.store.parent_length(parent).await?,
            queues,
            queue_choice,
        })
    }
}
