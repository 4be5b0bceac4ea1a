//! Messages exchanged with a connected worker, and the queue message body.
//!
//! Everything is tagged by a `type` field in SCREAMING_SNAKE_CASE with
//! camelCase fields, matching the JSON the worker speaks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Body of a run queue message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum MessageBody {
    Execute { task_identifier: String },
}

/// Server → worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    ServerReady {
        id: String,
    },
    BackgroundWorkerMessage {
        background_worker_id: String,
        data: WorkerCommand,
    },
}

/// Commands addressed to one background worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum WorkerCommand {
    ExecuteRunLazyAttempt {
        payload: LazyAttemptPayload,
    },
    ExecuteRuns {
        payloads: Vec<ExecutionPayload>,
    },
    CancelAttempt {
        task_attempt_id: String,
        task_run_id: String,
    },
}

/// Dispatch for workers that create their own attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LazyAttemptPayload {
    pub trace_context: serde_json::Value,
    pub environment: BTreeMap<String, String>,
    pub run_id: String,
    pub message_id: String,
    pub is_test: bool,
}

/// Dispatch carrying an attempt created by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPayload {
    pub trace_context: serde_json::Value,
    pub environment: BTreeMap<String, String>,
    pub execution: serde_json::Value,
}

/// Worker → server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    ReadyForTasks {
        background_worker_id: String,
        #[serde(default)]
        in_progress_runs: Vec<String>,
    },
    BackgroundWorkerDeprecated {
        background_worker_id: String,
    },
    BackgroundWorkerMessage {
        background_worker_id: String,
        data: WorkerEvent,
    },
}

impl ClientMessage {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum WorkerEvent {
    TaskRunCompleted {
        completion: TaskRunCompletion,
        execution: TaskRunExecution,
    },
    TaskRunFailedToRun {
        completion: TaskRunFailedCompletion,
    },
    /// Keyed by attempt friendly id. Superseded by `TaskRunHeartbeat`.
    TaskHeartbeat {
        id: String,
    },
    TaskRunHeartbeat {
        id: String,
    },
}

/// Result of one attempt. Fields other than `id` and `ok` are passed through
/// to the attempt service untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRunCompletion {
    pub id: String,
    pub ok: bool,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    /// Friendly run id.
    pub id: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRunExecution {
    pub run: ExecutionRun,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// A run the worker could not start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRunFailedCompletion {
    pub id: String,
    #[serde(default)]
    pub error: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_body() {
        let body: MessageBody =
            serde_json::from_value(json!({"type": "EXECUTE", "taskIdentifier": "my-task"}))
                .unwrap();
        assert_eq!(
            body,
            MessageBody::Execute {
                task_identifier: "my-task".into()
            }
        );

        assert!(serde_json::from_value::<MessageBody>(json!({"type": "RESUME"})).is_err());
        assert!(serde_json::from_value::<MessageBody>(json!({"type": "EXECUTE"})).is_err());
    }

    #[test]
    fn test_cancel_attempt_wire_shape() {
        let message = ServerMessage::BackgroundWorkerMessage {
            background_worker_id: "worker_1".into(),
            data: WorkerCommand::CancelAttempt {
                task_attempt_id: "attempt_1".into(),
                task_run_id: "run_1".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "BACKGROUND_WORKER_MESSAGE",
                "backgroundWorkerId": "worker_1",
                "data": {
                    "type": "CANCEL_ATTEMPT",
                    "taskAttemptId": "attempt_1",
                    "taskRunId": "run_1"
                }
            })
        );
    }

    #[test]
    fn test_parse_client_messages() {
        let ready = ClientMessage::from_json(
            r#"{"type":"READY_FOR_TASKS","backgroundWorkerId":"worker_1"}"#,
        )
        .unwrap();
        assert_eq!(
            ready,
            ClientMessage::ReadyForTasks {
                background_worker_id: "worker_1".into(),
                in_progress_runs: Vec::new(),
            }
        );

        let completed = ClientMessage::from_json(
            r#"{
                "type": "BACKGROUND_WORKER_MESSAGE",
                "backgroundWorkerId": "worker_1",
                "data": {
                    "type": "TASK_RUN_COMPLETED",
                    "completion": {"id": "attempt_1", "ok": true, "output": "42"},
                    "execution": {"run": {"id": "run_1", "tags": []}, "task": {"id": "t"}}
                }
            }"#,
        )
        .unwrap();
        match completed {
            ClientMessage::BackgroundWorkerMessage {
                data: WorkerEvent::TaskRunCompleted { completion, execution },
                ..
            } => {
                assert!(completion.ok);
                assert_eq!(completion.rest["output"], json!("42"));
                assert_eq!(execution.run.id, "run_1");
                assert!(execution.rest.contains_key("task"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
