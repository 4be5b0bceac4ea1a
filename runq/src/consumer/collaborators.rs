//! Seams between the queue consumer and the systems it drives.
//!
//! The consumer never talks to a database, a socket or an attempt service
//! directly. Each concern is a trait here, implemented by the host
//! application (and by in-memory fakes in `runq-testkit`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::protocol::{ServerMessage, TaskRunCompletion, TaskRunExecution, TaskRunFailedCompletion};
use crate::message::Environment;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

/// The fields of a task run the consumer reads and writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunRecord {
    /// Internal id, also the queue message id.
    pub id: String,
    /// Public id, `run_...`.
    pub friendly_id: String,
    pub task_identifier: String,
    /// Logical queue name, unsanitized.
    pub queue: String,
    pub status: TaskRunStatus,
    pub locked_at: Option<DateTime<Utc>>,
    /// Task the run is locked to.
    pub locked_by_id: Option<String>,
    /// Worker version the run is locked to.
    pub locked_to_version_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub is_test: bool,
    #[serde(default)]
    pub trace_context: serde_json::Value,
}

/// Lock a run to a task of a worker version and mark it executing.
#[derive(Clone, Debug, PartialEq)]
pub struct RunLock {
    pub run_id: String,
    pub task_id: String,
    pub worker_id: String,
    pub locked_at: DateTime<Utc>,
    /// First start time; kept when the run was started before.
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: String,
    pub slug: String,
}

/// One deployed version of a tenant's task code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundWorkerRecord {
    pub id: String,
    pub friendly_id: String,
    /// `YYYYMMDD.N` style version.
    pub version: String,
    pub supports_lazy_attempts: bool,
    pub tasks: Vec<BackgroundTask>,
}

impl BackgroundWorkerRecord {
    pub fn task(&self, slug: &str) -> Option<&BackgroundTask> {
        self.tasks.iter().find(|task| task.slug == slug)
    }

    pub fn task_slugs(&self) -> Vec<String> {
        self.tasks.iter().map(|task| task.slug.clone()).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueueRecord {
    pub id: String,
    /// Sanitized queue name.
    pub name: String,
    pub concurrency_limit: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub key: String,
    pub value: String,
}

/// How a completed attempt settled its run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttemptCompletionState {
    /// The run is finished.
    Completed,
    /// Another attempt was scheduled.
    Retrying,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CancelRunOptions {
    pub reason: String,
    /// Also cancel attempts that are still running.
    pub cancel_attempts: bool,
    pub cancelled_at: DateTime<Utc>,
}

/// Task run, worker and queue records.
#[async_trait]
pub trait TaskRunRepository: Send + Sync {
    async fn find_run(&self, id: &str) -> anyhow::Result<Option<TaskRunRecord>>;

    async fn find_run_by_friendly_id(
        &self,
        friendly_id: &str,
    ) -> anyhow::Result<Option<TaskRunRecord>>;

    /// Run id of the attempt with this friendly id.
    async fn find_attempt_run_id(&self, attempt_friendly_id: &str)
    -> anyhow::Result<Option<String>>;

    /// Apply the lock and set the run executing. `None` when the run is gone.
    async fn lock_run(&self, lock: &RunLock) -> anyhow::Result<Option<TaskRunRecord>>;

    /// Clear the lock fields, set the run pending and restore `started_at`.
    async fn unlock_run(
        &self,
        run_id: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    async fn find_worker(
        &self,
        env_id: &str,
        friendly_id: &str,
    ) -> anyhow::Result<Option<BackgroundWorkerRecord>>;

    async fn find_queue(&self, env_id: &str, name: &str)
    -> anyhow::Result<Option<TaskQueueRecord>>;
}

/// Outbound half of the worker connection.
#[async_trait]
pub trait WorkerMessageSender: Send + Sync {
    async fn send(&self, message: ServerMessage) -> anyhow::Result<()>;
}

/// Tracks which environments have a connected dev worker.
#[async_trait]
pub trait EnvironmentSessions: Send + Sync {
    async fn create_session(&self, env: &Environment, ip_address: &str) -> anyhow::Result<()>;

    async fn disconnect_session(&self, env_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait VariableResolver: Send + Sync {
    async fn resolve(&self, env: &Environment) -> anyhow::Result<Vec<EnvironmentVariable>>;
}

/// Attempt services the consumer delegates to.
#[async_trait]
pub trait AttemptLifecycle: Send + Sync {
    /// Create the next attempt of a run and return its execution descriptor.
    async fn create_attempt(
        &self,
        run_friendly_id: &str,
        env: &Environment,
    ) -> anyhow::Result<serde_json::Value>;

    async fn complete_attempt(
        &self,
        completion: &TaskRunCompletion,
        execution: &TaskRunExecution,
        env: &Environment,
    ) -> anyhow::Result<AttemptCompletionState>;

    async fn cancel_run(
        &self,
        run: &TaskRunRecord,
        options: &CancelRunOptions,
    ) -> anyhow::Result<()>;

    async fn fail_run(
        &self,
        run_id: &str,
        completion: &TaskRunFailedCompletion,
    ) -> anyhow::Result<()>;
}
