use chrono::Utc;
use runq::consumer::{
    BackgroundTask, BackgroundWorkerRecord, ConnectionHandle, ConsumerConnection,
    DevQueueConsumer, QueueConsumerBuilder, TaskQueueRecord, TaskRunRecord, TaskRunStatus,
};
use runq::{
    Environment, EnvironmentType, InMemoryRunQueueStore, InProcCancellationBus, MessagePayload,
    QueueConsumerConfig, RunQueue, RunQueueConfig, SimpleWeightedChoiceStrategy,
};
use std::sync::Arc;

use crate::{
    InMemoryTaskRuns, RecordingAttempts, RecordingSender, RecordingSessions, RecordingTracer,
    StaticVariables,
};

/// Install a test-writer subscriber filtered by `RUST_LOG`. Safe to call
/// from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn dev_environment(id: &str) -> Environment {
    Environment::new(id, EnvironmentType::Development, 10, "proj_1", "org_1")
}

pub fn prod_environment(id: &str, limit: u32) -> Environment {
    Environment::new(id, EnvironmentType::Production, limit, "proj_1", "org_1")
}

/// Run queue on the in-memory store with seeded strategies.
pub fn run_queue(config: RunQueueConfig) -> Arc<RunQueue> {
    let shared = Arc::new(SimpleWeightedChoiceStrategy::with_seed(
        config.queue_selection_count,
        7,
    ));
    let env = Arc::new(SimpleWeightedChoiceStrategy::with_seed(
        config.env_queue_selection_count,
        8,
    ));
    Arc::new(RunQueue::new(
        config,
        Arc::new(InMemoryRunQueueStore::new()),
        shared,
        env,
    ))
}

/// Payload for `run_id` on queue `task/<task>`, scored `timestamp`.
pub fn execute_message(env: &Environment, run_id: &str, task: &str, timestamp: i64) -> MessagePayload {
    MessagePayload::execute(env, run_id, task, format!("task/{task}")).with_timestamp(timestamp)
}

/// A pending, never-started run whose friendly id is `run_<id>`.
pub fn task_run(id: &str, task: &str) -> TaskRunRecord {
    TaskRunRecord {
        id: id.to_string(),
        friendly_id: format!("run_{id}"),
        task_identifier: task.to_string(),
        queue: format!("task/{task}"),
        status: TaskRunStatus::Pending,
        locked_at: None,
        locked_by_id: None,
        locked_to_version_id: None,
        started_at: None,
        is_test: false,
        trace_context: serde_json::json!({ "traceparent": format!("00-{id}-01") }),
    }
}

/// A worker with one task per slug; task ids are `<worker id>:<slug>`.
pub fn worker(id: &str, version: &str, lazy: bool, slugs: &[&str]) -> BackgroundWorkerRecord {
    BackgroundWorkerRecord {
        id: id.to_string(),
        friendly_id: format!("worker_{id}"),
        version: version.to_string(),
        supports_lazy_attempts: lazy,
        tasks: slugs
            .iter()
            .map(|slug| BackgroundTask {
                id: format!("{id}:{slug}"),
                slug: slug.to_string(),
            })
            .collect(),
    }
}

pub fn queue_record(name: &str) -> TaskQueueRecord {
    TaskQueueRecord {
        id: format!("queue_{}", name.replace('/', "_")),
        name: name.to_string(),
        concurrency_limit: None,
    }
}

/// One dev environment wired to recording fakes.
///
/// Fields are shared handles; inspect them after driving the consumer.
pub struct ConsumerHarness {
    pub env: Environment,
    pub config: QueueConsumerConfig,
    pub run_queue: Arc<RunQueue>,
    pub task_runs: InMemoryTaskRuns,
    pub sender: RecordingSender,
    pub sessions: RecordingSessions,
    pub variables: StaticVariables,
    pub attempts: RecordingAttempts,
    pub pubsub: Arc<InProcCancellationBus>,
    pub tracer: RecordingTracer,
}

impl Default for ConsumerHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerHarness {
    pub fn new() -> Self {
        Self {
            env: dev_environment("env_dev"),
            config: QueueConsumerConfig::default().with_ip_address("127.0.0.1"),
            run_queue: run_queue(RunQueueConfig::new("test").with_visibility_timeout(30)),
            task_runs: InMemoryTaskRuns::new(),
            sender: RecordingSender::new(),
            sessions: RecordingSessions::new(),
            variables: StaticVariables::new(&[("TRIGGER_API_URL", "http://localhost:3030")]),
            attempts: RecordingAttempts::new(),
            pubsub: Arc::new(InProcCancellationBus::default()),
            tracer: RecordingTracer::new(),
        }
    }

    /// Store the run and enqueue its message, scored `timestamp`.
    pub async fn enqueue_run(&self, run: TaskRunRecord, timestamp: i64) -> anyhow::Result<()> {
        let message = MessagePayload::execute(&self.env, &run.id, &run.task_identifier, &run.queue)
            .with_timestamp(timestamp);
        self.task_runs.insert_run(run);
        self.run_queue.enqueue_message(&self.env, message).await
    }

    /// Register `worker` and the queues its tasks run on.
    pub fn add_worker(&self, worker: BackgroundWorkerRecord) {
        for task in &worker.tasks {
            self.task_runs
                .insert_queue(&self.env.id, queue_record(&format!("task/{}", task.slug)));
        }
        self.task_runs.insert_worker(&self.env.id, worker);
    }

    /// Builder wired to the harness fakes; override a seam with its `with_*`.
    pub fn builder(&self) -> QueueConsumerBuilder {
        QueueConsumerBuilder::new(self.env.clone(), self.config.clone())
            .with_run_queue(Arc::clone(&self.run_queue))
            .with_task_runs(Arc::new(self.task_runs.clone()))
            .with_sender(Arc::new(self.sender.clone()))
            .with_sessions(Arc::new(self.sessions.clone()))
            .with_variables(Arc::new(self.variables.clone()))
            .with_attempts(Arc::new(self.attempts.clone()))
            .with_pubsub(self.pubsub.clone())
            .with_tracer(Arc::new(self.tracer.clone()))
    }

    pub fn consumer(&self) -> anyhow::Result<DevQueueConsumer> {
        self.builder().build()
    }

    pub fn connection(&self) -> anyhow::Result<(ConsumerConnection, ConnectionHandle)> {
        self.builder().build_connection()
    }

    /// Milliseconds now, for enqueue scores.
    pub fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
