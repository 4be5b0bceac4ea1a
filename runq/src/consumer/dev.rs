use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::collaborators::{
    AttemptCompletionState, AttemptLifecycle, BackgroundWorkerRecord, CancelRunOptions,
    EnvironmentSessions, RunLock, TaskRunRecord, TaskRunRepository, VariableResolver,
    WorkerMessageSender,
};
use super::protocol::{
    ExecutionPayload, LazyAttemptPayload, MessageBody, ServerMessage, TaskRunCompletion,
    TaskRunExecution, TaskRunFailedCompletion, WorkerCommand,
};
use super::worker::WorkerRegistry;
use crate::config::QueueConsumerConfig;
use crate::error::{MessageDisposition, ProcessError};
use crate::keys::sanitize_queue_name;
use crate::message::{DequeuedMessage, Environment};
use crate::pubsub::CancellationPubSub;
use crate::queue::RunQueue;
use crate::shutdown::ShutdownToken;
use crate::telemetry;
use crate::trace_batch::TraceBatcher;

pub const BATCH_SPAN_NAME: &str = "DevQueueConsumer.process";
const UNKNOWN_IP: &str = "unknown";

/// What gets sent to the worker, chosen by whether it creates its own
/// attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchPayload {
    Lazy(LazyAttemptPayload),
    Full(ExecutionPayload),
}

impl DispatchPayload {
    pub fn into_command(self) -> WorkerCommand {
        match self {
            DispatchPayload::Lazy(payload) => WorkerCommand::ExecuteRunLazyAttempt { payload },
            DispatchPayload::Full(payload) => WorkerCommand::ExecuteRuns {
                payloads: vec![payload],
            },
        }
    }
}

/// Collaborators and settings a [`DevQueueConsumer`] is assembled from.
pub(crate) struct ConsumerParts {
    pub env: Environment,
    pub config: QueueConsumerConfig,
    pub run_queue: Arc<RunQueue>,
    pub task_runs: Arc<dyn TaskRunRepository>,
    pub sender: Arc<dyn WorkerMessageSender>,
    pub sessions: Arc<dyn EnvironmentSessions>,
    pub variables: Arc<dyn VariableResolver>,
    pub attempts: Arc<dyn AttemptLifecycle>,
    pub pubsub: Arc<dyn CancellationPubSub>,
    pub trace: TraceBatcher,
}

/// Pulls runs for one development environment off the run queue and hands
/// them to the background workers registered on one connection.
///
/// Owned by a single connection task; every method takes `&mut self` and
/// nothing here is shared.
pub struct DevQueueConsumer {
    env: Environment,
    config: QueueConsumerConfig,
    run_queue: Arc<RunQueue>,
    task_runs: Arc<dyn TaskRunRepository>,
    sender: Arc<dyn WorkerMessageSender>,
    sessions: Arc<dyn EnvironmentSessions>,
    variables: Arc<dyn VariableResolver>,
    attempts: Arc<dyn AttemptLifecycle>,
    pubsub: Arc<dyn CancellationPubSub>,
    trace: TraceBatcher,
    workers: WorkerRegistry,
    /// Cancellation forwarders, by worker id.
    subscriptions: HashMap<String, JoinHandle<()>>,
    /// Run friendly id → message id.
    in_progress: HashMap<String, String>,
    enabled: bool,
    closing: ShutdownToken,
}

impl std::fmt::Debug for DevQueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevQueueConsumer")
            .field("env_id", &self.env.id)
            .field("enabled", &self.enabled)
            .field("workers", &self.workers)
            .field("in_progress", &self.in_progress.len())
            .field("trace", &self.trace)
            .finish_non_exhaustive()
    }
}

impl DevQueueConsumer {
    pub(crate) fn from_parts(parts: ConsumerParts) -> Self {
        Self {
            env: parts.env,
            config: parts.config,
            run_queue: parts.run_queue,
            task_runs: parts.task_runs,
            sender: parts.sender,
            sessions: parts.sessions,
            variables: parts.variables,
            attempts: parts.attempts,
            pubsub: parts.pubsub,
            trace: parts.trace,
            workers: WorkerRegistry::new(),
            subscriptions: HashMap::new(),
            in_progress: HashMap::new(),
            enabled: false,
            closing: ShutdownToken::new(),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn config(&self) -> &QueueConsumerConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.closing.is_cancelled()
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn trace(&self) -> &TraceBatcher {
        &self.trace
    }

    /// Friendly ids of runs dispatched and not yet settled, sorted.
    pub fn in_progress_runs(&self) -> Vec<String> {
        let mut runs: Vec<String> = self.in_progress.keys().cloned().collect();
        runs.sort();
        runs
    }

    /// Token that disables the consumer as soon as it fires, even while an
    /// iteration is in flight.
    pub fn closing_token(&self) -> ShutdownToken {
        self.closing.clone()
    }

    /// Start consuming. Returns `false` when already enabled or stopped.
    /// The consumer only counts as enabled once its session exists.
    pub async fn enable(&mut self) -> anyhow::Result<bool> {
        if self.enabled || self.closing.is_cancelled() {
            return Ok(false);
        }

        let ip = self.config.ip_address.as_deref().unwrap_or(UNKNOWN_IP);
        self.sessions.create_session(&self.env, ip).await?;
        self.enabled = true;
        self.trace.reset();

        tracing::info!(env_id = %self.env.id, "dev queue consumer enabled");
        Ok(true)
    }

    /// Register a worker announced by the connection and start consuming if
    /// this is the first one. Returns whether the consumer was enabled by
    /// this call.
    pub async fn register_background_worker(
        &mut self,
        friendly_id: &str,
        in_progress_runs: Vec<String>,
    ) -> anyhow::Result<bool> {
        let Some(worker) = self.task_runs.find_worker(&self.env.id, friendly_id).await? else {
            tracing::debug!(worker = %friendly_id, "unknown background worker");
            return Ok(false);
        };
        if self.workers.contains(&worker.id) {
            // A repeated announcement retries an enable that failed earlier.
            return self.enable().await;
        }

        let forwarder = self.spawn_cancellation_forwarder(&worker).await?;
        if let Some(previous) = self.subscriptions.insert(worker.id.clone(), forwarder) {
            previous.abort();
        }

        tracing::debug!(
            worker_id = %worker.id,
            version = %worker.version,
            in_progress = in_progress_runs.len(),
            "registered background worker"
        );
        self.workers.register(worker);

        for run_id in in_progress_runs {
            self.in_progress.insert(run_id.clone(), run_id);
        }

        self.enable().await
    }

    async fn spawn_cancellation_forwarder(
        &self,
        worker: &BackgroundWorkerRecord,
    ) -> anyhow::Result<JoinHandle<()>> {
        let mut subscription = self.pubsub.subscribe(&worker.id).await?;
        let sender = Arc::clone(&self.sender);
        let background_worker_id = worker.friendly_id.clone();

        Ok(tokio::spawn(async move {
            while let Some(request) = subscription.recv().await {
                let message = ServerMessage::BackgroundWorkerMessage {
                    background_worker_id: background_worker_id.clone(),
                    data: WorkerCommand::CancelAttempt {
                        task_attempt_id: request.attempt_id,
                        task_run_id: request.task_run_id,
                    },
                };
                if let Err(err) = sender.send(message).await {
                    tracing::warn!(
                        topic = %subscription.topic(),
                        "failed to forward attempt cancellation: {err:#}"
                    );
                }
            }
        }))
    }

    /// Stop choosing a worker for new runs. Runs locked to it still resolve.
    pub fn deprecate_background_worker(&mut self, worker_id: &str) -> bool {
        self.workers.deprecate(worker_id)
    }

    /// One pass of the poll loop. Returns the delay before the next pass, or
    /// `None` when the loop should stop.
    pub async fn process_iteration(&mut self) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }

        self.trace.begin_iteration(&self.env);
        let next = self.process_next().await;
        self.trace.finish_iteration();
        next
    }

    async fn process_next(&mut self) -> Option<Duration> {
        let message = match self.run_queue.dequeue_message_in_env(&self.env).await {
            Ok(Some(message)) => message,
            Ok(None) => return Some(self.config.empty_queue_delay()),
            Err(err) => {
                tracing::warn!(env_id = %self.env.id, "dequeue failed: {err:#}");
                return Some(self.config.error_delay());
            }
        };

        let span = telemetry::dispatch_span(&message.message_id, &self.env.id);
        let outcome = self.dispatch_message(&message).instrument(span).await;

        match outcome {
            Ok(()) => {
                telemetry::record_consumer_outcome(&message.message_id, "dispatched");
                Some(self.config.message_delay())
            }
            Err(err) => self.settle_failure(&message, err).await,
        }
    }

    async fn settle_failure(
        &mut self,
        message: &DequeuedMessage,
        err: ProcessError,
    ) -> Option<Duration> {
        telemetry::record_consumer_outcome(&message.message_id, err.kind());

        match &err {
            ProcessError::InvalidBody(_) => {
                tracing::error!(message_id = %message.message_id, body = %message.message.data, "{err}");
            }
            ProcessError::TaskNotFound { .. } | ProcessError::LockFailed(_) => {
                tracing::warn!(message_id = %message.message_id, "{err}");
            }
            ProcessError::Repository(_) | ProcessError::Dispatch(_) => {
                tracing::warn!(message_id = %message.message_id, "{err}");
            }
            _ => tracing::debug!(message_id = %message.message_id, "{err}"),
        }

        let settled = match err.disposition() {
            MessageDisposition::Ack => self.run_queue.acknowledge_message(&message.message_id).await,
            MessageDisposition::Nack => self.run_queue.nack_message(&message.message_id).await,
        };
        if let Err(settle_err) = settled {
            tracing::warn!(
                message_id = %message.message_id,
                "failed to settle message: {settle_err:#}"
            );
        }

        if !err.reschedules() {
            return None;
        }
        match err {
            ProcessError::QueueNotFound(_) => Some(self.config.queue_missing_delay()),
            _ => Some(self.config.message_delay()),
        }
    }

    async fn dispatch_message(&mut self, message: &DequeuedMessage) -> Result<(), ProcessError> {
        let MessageBody::Execute { task_identifier } =
            serde_json::from_value(message.message.data.clone()).map_err(ProcessError::InvalidBody)?;

        let run = self
            .task_runs
            .find_run(&message.message_id)
            .await
            .map_err(ProcessError::Repository)?
            .ok_or_else(|| ProcessError::RunNotFound(message.message_id.clone()))?;

        let worker = self
            .workers
            .resolve(run.locked_to_version_id.as_deref())
            .cloned()
            .ok_or_else(|| {
                ProcessError::NoWorker(
                    run.locked_to_version_id
                        .clone()
                        .unwrap_or_else(|| "latest".to_string()),
                )
            })?;
        tracing::Span::current().record("worker_id", worker.id.as_str());
        tracing::Span::current().record("task", task_identifier.as_str());

        let task = worker
            .task(&run.task_identifier)
            .ok_or_else(|| ProcessError::TaskNotFound {
                identifier: run.task_identifier.clone(),
                slugs: worker.task_slugs(),
            })?;

        let now = Utc::now();
        let lock = RunLock {
            run_id: run.id.clone(),
            task_id: task.id.clone(),
            worker_id: worker.id.clone(),
            locked_at: now,
            started_at: run.started_at.unwrap_or(now),
        };
        let locked = self
            .task_runs
            .lock_run(&lock)
            .await
            .map_err(ProcessError::Repository)?
            .ok_or_else(|| ProcessError::LockFailed(run.id.clone()))?;

        let queue_name = sanitize_queue_name(&locked.queue);
        self.task_runs
            .find_queue(&self.env.id, &queue_name)
            .await
            .map_err(ProcessError::Repository)?
            .ok_or_else(|| ProcessError::QueueNotFound(queue_name.clone()))?;

        if !self.is_enabled() {
            return Err(ProcessError::Disabled);
        }

        if let Err(err) = self.send_run(&worker, &locked).await {
            self.trace.record_exception(&format!("{err:#}"));
            if let Err(unlock_err) = self.task_runs.unlock_run(&locked.id, run.started_at).await {
                tracing::error!(run_id = %locked.id, "failed to unlock run: {unlock_err:#}");
            }
            self.in_progress.remove(&locked.friendly_id);
            return Err(ProcessError::Dispatch(err));
        }

        tracing::debug!(message_id = %message.message_id, "executing the run");
        self.in_progress
            .insert(locked.friendly_id.clone(), message.message_id.clone());
        Ok(())
    }

    async fn send_run(
        &self,
        worker: &BackgroundWorkerRecord,
        run: &TaskRunRecord,
    ) -> anyhow::Result<()> {
        let environment: BTreeMap<String, String> = self
            .variables
            .resolve(&self.env)
            .await?
            .into_iter()
            .map(|variable| (variable.key, variable.value))
            .collect();

        let payload = if worker.supports_lazy_attempts {
            DispatchPayload::Lazy(LazyAttemptPayload {
                trace_context: run.trace_context.clone(),
                environment,
                run_id: run.friendly_id.clone(),
                message_id: run.id.clone(),
                is_test: run.is_test,
            })
        } else {
            let execution = self
                .attempts
                .create_attempt(&run.friendly_id, &self.env)
                .await?;
            DispatchPayload::Full(ExecutionPayload {
                trace_context: run.trace_context.clone(),
                environment,
                execution,
            })
        };

        self.sender
            .send(ServerMessage::BackgroundWorkerMessage {
                background_worker_id: worker.friendly_id.clone(),
                data: payload.into_command(),
            })
            .await
    }

    pub async fn task_attempt_completed(
        &mut self,
        worker_id: &str,
        completion: &TaskRunCompletion,
        execution: &TaskRunExecution,
    ) -> anyhow::Result<()> {
        if completion.ok {
            self.trace.record_success();
        } else {
            self.trace.record_failure();
        }
        tracing::debug!(worker_id = %worker_id, run = %execution.run.id, ok = completion.ok, "attempt completed");

        let state = self
            .attempts
            .complete_attempt(completion, execution, &self.env)
            .await?;
        if state == AttemptCompletionState::Completed {
            if let Some(message_id) = self.in_progress.remove(&execution.run.id) {
                self.release_run(&message_id).await;
            }
        }
        Ok(())
    }

    pub async fn task_run_failed(
        &mut self,
        worker_id: &str,
        completion: &TaskRunFailedCompletion,
    ) -> anyhow::Result<()> {
        self.trace.record_failure();
        tracing::debug!(worker_id = %worker_id, run = %completion.id, "run failed to start");

        let message_id = self.in_progress.remove(&completion.id);
        self.attempts.fail_run(&completion.id, completion).await?;
        if let Some(message_id) = message_id {
            self.release_run(&message_id).await;
        }
        Ok(())
    }

    /// Ack a finished run's message so its concurrency slot frees up now
    /// rather than at the visibility timeout.
    async fn release_run(&self, message_id: &str) {
        if let Err(err) = self.run_queue.acknowledge_message(message_id).await {
            tracing::warn!(message_id = %message_id, "failed to ack finished run: {err:#}");
        }
    }

    /// Heartbeat keyed by attempt friendly id. Unknown attempts are ignored.
    pub async fn task_heartbeat(&self, worker_id: &str, attempt_id: &str, seconds: u64) {
        tracing::debug!(worker_id = %worker_id, attempt = %attempt_id, seconds, "task heartbeat");

        match self.task_runs.find_attempt_run_id(attempt_id).await {
            Ok(Some(run_id)) => self.heartbeat_run(&run_id, seconds).await,
            Ok(None) => {}
            Err(err) => tracing::warn!(attempt = %attempt_id, "attempt lookup failed: {err:#}"),
        }
    }

    pub async fn task_run_heartbeat(&self, worker_id: &str, run_id: &str, seconds: u64) {
        tracing::debug!(worker_id = %worker_id, run_id = %run_id, seconds, "task run heartbeat");
        self.heartbeat_run(run_id, seconds).await;
    }

    async fn heartbeat_run(&self, run_id: &str, seconds: u64) {
        if let Err(err) = self.run_queue.heartbeat_message(run_id, seconds).await {
            tracing::warn!(run_id = %run_id, "heartbeat failed: {err:#}");
        }
    }

    /// Tear down after the connection went away: drop the session, cancel
    /// every in-progress run, unsubscribe and close the batch span.
    pub async fn stop(&mut self, reason: &str) {
        if !self.enabled {
            return;
        }

        tracing::debug!(env_id = %self.env.id, reason = %reason, "stopping dev queue consumer");
        self.enabled = false;
        self.closing.cancel();

        if let Err(err) = self.sessions.disconnect_session(&self.env.id).await {
            tracing::warn!(env_id = %self.env.id, "failed to disconnect session: {err:#}");
        }

        self.cancel_in_progress_runs(reason).await;

        for (worker_id, forwarder) in self.subscriptions.drain() {
            forwarder.abort();
            tracing::debug!(worker_id = %worker_id, "unsubscribed from background worker channel");
        }

        self.trace.close();
    }

    async fn cancel_in_progress_runs(&mut self, reason: &str) {
        let runs = std::mem::take(&mut self.in_progress);
        let options = CancelRunOptions {
            reason: reason.to_string(),
            cancel_attempts: true,
            cancelled_at: Utc::now(),
        };

        tracing::debug!(runs = ?runs.keys().collect::<Vec<_>>(), "cancelling in-progress runs");

        let cancels = runs
            .into_values()
            .map(|run_id| self.cancel_in_progress_run(run_id, &options));
        futures::future::join_all(cancels).await;
    }

    async fn cancel_in_progress_run(&self, run_id: String, options: &CancelRunOptions) {
        let lookup = if run_id.starts_with("run_") {
            self.task_runs.find_run_by_friendly_id(&run_id).await
        } else {
            self.task_runs.find_run(&run_id).await
        };

        let run = match lookup {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(run_id = %run_id, "failed to load in-progress run: {err:#}");
                return;
            }
        };

        match self.attempts.cancel_run(&run, options).await {
            Ok(()) => self.release_run(&run.id).await,
            Err(err) => {
                tracing::error!(run_id = %run_id, "failed to cancel in-progress run: {err:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_payload_commands() {
        let lazy = DispatchPayload::Lazy(LazyAttemptPayload {
            trace_context: serde_json::json!({}),
            environment: BTreeMap::new(),
            run_id: "run_1".into(),
            message_id: "r1".into(),
            is_test: false,
        });
        assert!(matches!(
            lazy.into_command(),
            WorkerCommand::ExecuteRunLazyAttempt { .. }
        ));

        let full = DispatchPayload::Full(ExecutionPayload {
            trace_context: serde_json::json!({}),
            environment: BTreeMap::from([("API_KEY".to_string(), "k".to_string())]),
            execution: serde_json::json!({"attempt": {"number": 1}}),
        });
        match full.into_command() {
            WorkerCommand::ExecuteRuns { payloads } => {
                assert_eq!(payloads.len(), 1);
                assert_eq!(payloads[0].environment["API_KEY"], "k");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
