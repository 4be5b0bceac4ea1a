use async_trait::async_trait;
use parking_lot::Mutex;
use runq::consumer::{
    AttemptCompletionState, AttemptLifecycle, CancelRunOptions, EnvironmentSessions,
    EnvironmentVariable, TaskRunCompletion, TaskRunExecution, TaskRunFailedCompletion,
    TaskRunRecord, VariableResolver,
};
use runq::Environment;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub struct CancelledRun {
    pub run_id: String,
    pub reason: String,
    pub cancel_attempts: bool,
}

#[derive(Default)]
struct AttemptLog {
    created: Vec<String>,
    completed: Vec<String>,
    cancelled: Vec<CancelledRun>,
    failed: Vec<String>,
    failing_cancels: HashSet<String>,
}

/// Attempt services that record calls and answer with canned results.
#[derive(Clone)]
pub struct RecordingAttempts {
    log: Arc<Mutex<AttemptLog>>,
    completion_state: Arc<Mutex<AttemptCompletionState>>,
}

impl Default for RecordingAttempts {
    fn default() -> Self {
        Self {
            log: Arc::default(),
            completion_state: Arc::new(Mutex::new(AttemptCompletionState::Completed)),
        }
    }
}

impl RecordingAttempts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_completion_state(&self, state: AttemptCompletionState) {
        *self.completion_state.lock() = state;
    }

    /// Make cancelling this run fail.
    pub fn fail_cancel_of(&self, run_id: &str) {
        self.log.lock().failing_cancels.insert(run_id.to_string());
    }

    pub fn created(&self) -> Vec<String> {
        self.log.lock().created.clone()
    }

    pub fn completed(&self) -> Vec<String> {
        self.log.lock().completed.clone()
    }

    pub fn cancelled(&self) -> Vec<CancelledRun> {
        self.log.lock().cancelled.clone()
    }

    pub fn failed(&self) -> Vec<String> {
        self.log.lock().failed.clone()
    }
}

#[async_trait]
impl AttemptLifecycle for RecordingAttempts {
    async fn create_attempt(
        &self,
        run_friendly_id: &str,
        env: &Environment,
    ) -> anyhow::Result<serde_json::Value> {
        let mut log = self.log.lock();
        log.created.push(run_friendly_id.to_string());
        let number = log.created.len();
        Ok(serde_json::json!({
            "run": { "id": run_friendly_id },
            "attempt": { "id": format!("attempt_{number}"), "number": number },
            "environment": { "id": env.id },
        }))
    }

    async fn complete_attempt(
        &self,
        _completion: &TaskRunCompletion,
        execution: &TaskRunExecution,
        _env: &Environment,
    ) -> anyhow::Result<AttemptCompletionState> {
        self.log.lock().completed.push(execution.run.id.clone());
        Ok(*self.completion_state.lock())
    }

    async fn cancel_run(
        &self,
        run: &TaskRunRecord,
        options: &CancelRunOptions,
    ) -> anyhow::Result<()> {
        let mut log = self.log.lock();
        if log.failing_cancels.contains(&run.id) {
            anyhow::bail!("cancel of {} failed", run.id);
        }
        log.cancelled.push(CancelledRun {
            run_id: run.id.clone(),
            reason: options.reason.clone(),
            cancel_attempts: options.cancel_attempts,
        });
        Ok(())
    }

    async fn fail_run(
        &self,
        run_id: &str,
        _completion: &TaskRunFailedCompletion,
    ) -> anyhow::Result<()> {
        self.log.lock().failed.push(run_id.to_string());
        Ok(())
    }
}

/// Session store that records connects and disconnects.
#[derive(Clone, Default)]
pub struct RecordingSessions {
    created: Arc<Mutex<Vec<(String, String)>>>,
    disconnected: Arc<Mutex<Vec<String>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl RecordingSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(env_id, ip_address)` per session created.
    pub fn created(&self) -> Vec<(String, String)> {
        self.created.lock().clone()
    }

    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected.lock().clone()
    }

    /// Make `create_session` fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }
}

#[async_trait]
impl EnvironmentSessions for RecordingSessions {
    async fn create_session(&self, env: &Environment, ip_address: &str) -> anyhow::Result<()> {
        if *self.unavailable.lock() {
            anyhow::bail!("session store unavailable");
        }
        self.created
            .lock()
            .push((env.id.clone(), ip_address.to_string()));
        Ok(())
    }

    async fn disconnect_session(&self, env_id: &str) -> anyhow::Result<()> {
        self.disconnected.lock().push(env_id.to_string());
        Ok(())
    }
}

/// Resolves the same variables for every environment.
#[derive(Clone, Default)]
pub struct StaticVariables {
    variables: Arc<Mutex<Vec<EnvironmentVariable>>>,
}

impl StaticVariables {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let variables = pairs
            .iter()
            .map(|(key, value)| EnvironmentVariable {
                key: key.to_string(),
                value: value.to_string(),
            })
            .collect();
        Self {
            variables: Arc::new(Mutex::new(variables)),
        }
    }
}

#[async_trait]
impl VariableResolver for StaticVariables {
    async fn resolve(&self, _env: &Environment) -> anyhow::Result<Vec<EnvironmentVariable>> {
        Ok(self.variables.lock().clone())
    }
}
