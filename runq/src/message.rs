use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::error::RunQueueError;

/// Deployment stage of an environment. Only production queues are indexed
/// in the shared pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentType {
    Development,
    Staging,
    Production,
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Development => "DEVELOPMENT",
            EnvironmentType::Staging => "STAGING",
            EnvironmentType::Production => "PRODUCTION",
        }
    }
}

impl Display for EnvironmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime environment owned by a project within an organization.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
    /// Cap on in-flight messages across every queue of the environment.
    pub maximum_concurrency_limit: u32,
    pub project_id: String,
    pub organization_id: String,
}

impl Environment {
    pub fn new(
        id: impl Into<String>,
        env_type: EnvironmentType,
        maximum_concurrency_limit: u32,
        project_id: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            env_type,
            maximum_concurrency_limit,
            project_id: project_id.into(),
            organization_id: organization_id.into(),
        }
    }
}

/// The only payload version this crate writes.
pub const MESSAGE_VERSION: &str = "1";

/// A unit of work stored in the run queue. The run id doubles as the
/// message id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub version: String,
    pub run_id: String,
    pub task_identifier: String,
    pub org_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub environment_type: EnvironmentType,
    pub queue: String,
    /// Milliseconds since the epoch; used as the ordering score.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_key: Option<String>,
    /// Opaque body handed to the consumer.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl MessagePayload {
    /// Build an `EXECUTE` payload for a run in `env`, timestamped now.
    pub fn execute(
        env: &Environment,
        run_id: impl Into<String>,
        task_identifier: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        let task_identifier = task_identifier.into();
        Self {
            version: MESSAGE_VERSION.to_string(),
            run_id: run_id.into(),
            data: serde_json::json!({
                "type": "EXECUTE",
                "taskIdentifier": task_identifier,
            }),
            task_identifier,
            org_id: env.organization_id.clone(),
            project_id: env.project_id.clone(),
            environment_id: env.id.clone(),
            environment_type: env.env_type,
            queue: queue.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            concurrency_key: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn message_id(&self) -> &str {
        &self.run_id
    }

    pub fn to_json(&self) -> Result<String, RunQueueError> {
        serde_json::to_string(self).map_err(RunQueueError::Serialization)
    }

    pub fn from_json(raw: &str) -> Result<Self, RunQueueError> {
        serde_json::from_str(raw).map_err(RunQueueError::Serialization)
    }
}

/// A message handed out by a dequeue, now in flight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeuedMessage {
    pub message_id: String,
    /// Key of the queue the message was taken from.
    pub queue: String,
    pub message: MessagePayload,
    /// Number of times this message has been delivered, starting at 1.
    pub attempt: u32,
    /// Visibility deadline in milliseconds since the epoch.
    pub visible_until: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_wire_shape() {
        let env = Environment::new("e1", EnvironmentType::Production, 10, "p1", "o1");
        let payload = MessagePayload::execute(&env, "r1", "my-task", "task/my-task")
            .with_timestamp(1_700_000_000_000);

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["runId"], "r1");
        assert_eq!(value["environmentType"], "PRODUCTION");
        assert_eq!(value["version"], "1");
        assert!(value.get("concurrencyKey").is_none());
        assert_eq!(value["data"]["type"], "EXECUTE");
        assert_eq!(value["data"]["taskIdentifier"], "my-task");

        let parsed = MessagePayload::from_json(&payload.to_json().unwrap()).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_environment_type_display() {
        assert_eq!(EnvironmentType::Development.to_string(), "DEVELOPMENT");
    }
}
