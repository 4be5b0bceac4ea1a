use std::fmt;
use std::sync::Arc;

use super::collaborators::{
    AttemptLifecycle, EnvironmentSessions, TaskRunRepository, VariableResolver,
    WorkerMessageSender,
};
use super::connection::{ConnectionHandle, ConsumerConnection};
use super::dev::{ConsumerParts, DevQueueConsumer, BATCH_SPAN_NAME};
use crate::config::QueueConsumerConfig;
use crate::message::Environment;
use crate::pubsub::CancellationPubSub;
use crate::queue::RunQueue;
use crate::telemetry::{ConsumerTracer, TracingConsumerTracer};
use crate::trace_batch::TraceBatcher;

/// Builder for a [`DevQueueConsumer`] and its connection.
///
/// Every collaborator is required except the tracer, which defaults to
/// [`TracingConsumerTracer`].
///
/// # Example
///
/// ```ignore
/// let (connection, handle) = QueueConsumerBuilder::new(env, QueueConsumerConfig::default())
///     .with_run_queue(run_queue)
///     .with_task_runs(task_runs)
///     .with_sender(sender)
///     .with_sessions(sessions)
///     .with_variables(variables)
///     .with_attempts(attempts)
///     .with_pubsub(pubsub)
///     .build_connection()?;
/// connection.spawn();
/// ```
pub struct QueueConsumerBuilder {
    env: Environment,
    config: QueueConsumerConfig,
    run_queue: Option<Arc<RunQueue>>,
    task_runs: Option<Arc<dyn TaskRunRepository>>,
    sender: Option<Arc<dyn WorkerMessageSender>>,
    sessions: Option<Arc<dyn EnvironmentSessions>>,
    variables: Option<Arc<dyn VariableResolver>>,
    attempts: Option<Arc<dyn AttemptLifecycle>>,
    pubsub: Option<Arc<dyn CancellationPubSub>>,
    tracer: Option<Arc<dyn ConsumerTracer>>,
}

impl fmt::Debug for QueueConsumerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConsumerBuilder")
            .field("env_id", &self.env.id)
            .field("config", &self.config)
            .field("run_queue_set", &self.run_queue.is_some())
            .field("task_runs_set", &self.task_runs.is_some())
            .field("sender_set", &self.sender.is_some())
            .field("sessions_set", &self.sessions.is_some())
            .field("variables_set", &self.variables.is_some())
            .field("attempts_set", &self.attempts.is_some())
            .field("pubsub_set", &self.pubsub.is_some())
            .field("tracer_set", &self.tracer.is_some())
            .finish()
    }
}

impl QueueConsumerBuilder {
    pub fn new(env: Environment, config: QueueConsumerConfig) -> Self {
        Self {
            env,
            config,
            run_queue: None,
            task_runs: None,
            sender: None,
            sessions: None,
            variables: None,
            attempts: None,
            pubsub: None,
            tracer: None,
        }
    }

    pub fn with_run_queue(mut self, run_queue: Arc<RunQueue>) -> Self {
        self.run_queue = Some(run_queue);
        self
    }

    pub fn with_task_runs(mut self, task_runs: Arc<dyn TaskRunRepository>) -> Self {
        self.task_runs = Some(task_runs);
        self
    }

    pub fn with_sender(mut self, sender: Arc<dyn WorkerMessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn EnvironmentSessions>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_variables(mut self, variables: Arc<dyn VariableResolver>) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_attempts(mut self, attempts: Arc<dyn AttemptLifecycle>) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_pubsub(mut self, pubsub: Arc<dyn CancellationPubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn ConsumerTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// # Errors
    ///
    /// Returns an error if any required collaborator is missing.
    pub fn build(self) -> anyhow::Result<DevQueueConsumer> {
        self.build_parts().map(|(consumer, _)| consumer)
    }

    /// Build the consumer wrapped in a connection, plus the handle used to
    /// feed and close it.
    pub fn build_connection(self) -> anyhow::Result<(ConsumerConnection, ConnectionHandle)> {
        let (consumer, sender) = self.build_parts()?;
        Ok(ConsumerConnection::new(consumer, sender))
    }

    fn build_parts(self) -> anyhow::Result<(DevQueueConsumer, Arc<dyn WorkerMessageSender>)> {
        let run_queue = self
            .run_queue
            .ok_or_else(|| anyhow::anyhow!("run_queue dependency missing"))?;
        let task_runs = self
            .task_runs
            .ok_or_else(|| anyhow::anyhow!("task_runs dependency missing"))?;
        let sender = self
            .sender
            .ok_or_else(|| anyhow::anyhow!("sender dependency missing"))?;
        let sessions = self
            .sessions
            .ok_or_else(|| anyhow::anyhow!("sessions dependency missing"))?;
        let variables = self
            .variables
            .ok_or_else(|| anyhow::anyhow!("variables dependency missing"))?;
        let attempts = self
            .attempts
            .ok_or_else(|| anyhow::anyhow!("attempts dependency missing"))?;
        let pubsub = self
            .pubsub
            .ok_or_else(|| anyhow::anyhow!("pubsub dependency missing"))?;
        let tracer = self
            .tracer
            .unwrap_or_else(|| Arc::new(TracingConsumerTracer));

        let trace = TraceBatcher::new(
            tracer,
            BATCH_SPAN_NAME,
            self.config.maximum_items_per_trace,
            self.config.trace_timeout(),
        );

        let consumer = DevQueueConsumer::from_parts(ConsumerParts {
            env: self.env,
            config: self.config,
            run_queue,
            task_runs,
            sender: Arc::clone(&sender),
            sessions,
            variables,
            attempts,
            pubsub,
            trace,
        });
        Ok((consumer, sender))
    }
}
