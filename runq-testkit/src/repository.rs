use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use runq::consumer::{
    BackgroundWorkerRecord, RunLock, TaskQueueRecord, TaskRunRecord, TaskRunRepository,
    TaskRunStatus,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Records {
    runs: HashMap<String, TaskRunRecord>,
    attempts: HashMap<String, String>,
    workers: Vec<(String, BackgroundWorkerRecord)>,
    queues: HashMap<(String, String), TaskQueueRecord>,
    locks: Vec<RunLock>,
    unlocks: Vec<String>,
    lock_fails: bool,
    unavailable: bool,
}

/// Task runs, attempts, workers and queues held in memory.
#[derive(Clone, Default)]
pub struct InMemoryTaskRuns {
    records: Arc<Mutex<Records>>,
}

impl InMemoryTaskRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_run(&self, run: TaskRunRecord) {
        self.records.lock().runs.insert(run.id.clone(), run);
    }

    pub fn remove_run(&self, id: &str) {
        self.records.lock().runs.remove(id);
    }

    pub fn insert_attempt(&self, attempt_friendly_id: &str, run_id: &str) {
        self.records
            .lock()
            .attempts
            .insert(attempt_friendly_id.to_string(), run_id.to_string());
    }

    pub fn insert_worker(&self, env_id: &str, worker: BackgroundWorkerRecord) {
        self.records.lock().workers.push((env_id.to_string(), worker));
    }

    pub fn insert_queue(&self, env_id: &str, queue: TaskQueueRecord) {
        self.records
            .lock()
            .queues
            .insert((env_id.to_string(), queue.name.clone()), queue);
    }

    pub fn run(&self, id: &str) -> Option<TaskRunRecord> {
        self.records.lock().runs.get(id).cloned()
    }

    pub fn locks(&self) -> Vec<RunLock> {
        self.records.lock().locks.clone()
    }

    pub fn unlocks(&self) -> Vec<String> {
        self.records.lock().unlocks.clone()
    }

    /// Make `lock_run` report that the run could not be locked.
    pub fn set_lock_fails(&self, fails: bool) {
        self.records.lock().lock_fails = fails;
    }

    /// Make every lookup fail, as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.records.lock().unavailable = unavailable;
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.records.lock().unavailable {
            anyhow::bail!("task run store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRunRepository for InMemoryTaskRuns {
    async fn find_run(&self, id: &str) -> anyhow::Result<Option<TaskRunRecord>> {
        self.check_available()?;
        Ok(self.run(id))
    }

    async fn find_run_by_friendly_id(
        &self,
        friendly_id: &str,
    ) -> anyhow::Result<Option<TaskRunRecord>> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .runs
            .values()
            .find(|run| run.friendly_id == friendly_id)
            .cloned())
    }

    async fn find_attempt_run_id(
        &self,
        attempt_friendly_id: &str,
    ) -> anyhow::Result<Option<String>> {
        self.check_available()?;
        Ok(self.records.lock().attempts.get(attempt_friendly_id).cloned())
    }

    async fn lock_run(&self, lock: &RunLock) -> anyhow::Result<Option<TaskRunRecord>> {
        self.check_available()?;
        let mut records = self.records.lock();
        if records.lock_fails {
            return Ok(None);
        }
        records.locks.push(lock.clone());

        let Some(run) = records.runs.get_mut(&lock.run_id) else {
            return Ok(None);
        };
        run.status = TaskRunStatus::Executing;
        run.locked_at = Some(lock.locked_at);
        run.locked_by_id = Some(lock.task_id.clone());
        run.locked_to_version_id = Some(lock.worker_id.clone());
        run.started_at = Some(lock.started_at);
        Ok(Some(run.clone()))
    }

    async fn unlock_run(
        &self,
        run_id: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        self.check_available()?;
        let mut records = self.records.lock();
        records.unlocks.push(run_id.to_string());

        if let Some(run) = records.runs.get_mut(run_id) {
            run.status = TaskRunStatus::Pending;
            run.locked_at = None;
            run.locked_by_id = None;
            run.started_at = started_at;
        }
        Ok(())
    }

    async fn find_worker(
        &self,
        env_id: &str,
        friendly_id: &str,
    ) -> anyhow::Result<Option<BackgroundWorkerRecord>> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .workers
            .iter()
            .find(|(env, worker)| env == env_id && worker.friendly_id == friendly_id)
            .map(|(_, worker)| worker.clone()))
    }

    async fn find_queue(
        &self,
        env_id: &str,
        name: &str,
    ) -> anyhow::Result<Option<TaskQueueRecord>> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .queues
            .get(&(env_id.to_string(), name.to_string()))
            .cloned())
    }
}
