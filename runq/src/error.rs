use thiserror::Error;

/// Errors raised by the run queue itself. Store failures travel as
/// `anyhow::Error` through the [`crate::store::RunQueueStore`] seam.
#[derive(Debug, Error)]
pub enum RunQueueError {
    #[error("malformed queue key: {0}")]
    MalformedQueueKey(String),
    #[error("message payload could not be (de)serialized")]
    Serialization(#[source] serde_json::Error),
}

/// What happens to the queue message after a failed processing step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageDisposition {
    /// Drop the message for good.
    Ack,
    /// Return the message to its queue for redelivery.
    Nack,
}

/// Reasons a dequeued message could not be dispatched to the worker.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("message body could not be parsed")]
    InvalidBody(#[source] serde_json::Error),
    #[error("task run {0} not found")]
    RunNotFound(String),
    #[error("no active worker for version {0}")]
    NoWorker(String),
    #[error("task {identifier} not found among worker tasks [{}]", .slugs.join(", "))]
    TaskNotFound {
        identifier: String,
        slugs: Vec<String>,
    },
    #[error("task run {0} could not be locked")]
    LockFailed(String),
    #[error("queue {0} not found")]
    QueueNotFound(String),
    #[error("consumer is disabled")]
    Disabled,
    #[error("task run store failed: {0:#}")]
    Repository(#[source] anyhow::Error),
    #[error("dispatch failed: {0:#}")]
    Dispatch(#[source] anyhow::Error),
}

impl ProcessError {
    pub fn disposition(&self) -> MessageDisposition {
        match self {
            ProcessError::InvalidBody(_)
            | ProcessError::RunNotFound(_)
            | ProcessError::NoWorker(_)
            | ProcessError::TaskNotFound { .. }
            | ProcessError::LockFailed(_) => MessageDisposition::Ack,
            ProcessError::QueueNotFound(_)
            | ProcessError::Disabled
            | ProcessError::Repository(_)
            | ProcessError::Dispatch(_) => MessageDisposition::Nack,
        }
    }

    /// Whether the consumer should keep polling after this error.
    pub fn reschedules(&self) -> bool {
        !matches!(self, ProcessError::Disabled)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::InvalidBody(_) => "invalid_body",
            ProcessError::RunNotFound(_) => "run_not_found",
            ProcessError::NoWorker(_) => "no_worker",
            ProcessError::TaskNotFound { .. } => "task_not_found",
            ProcessError::LockFailed(_) => "lock_failed",
            ProcessError::QueueNotFound(_) => "queue_not_found",
            ProcessError::Disabled => "disabled",
            ProcessError::Repository(_) => "repository",
            ProcessError::Dispatch(_) => "dispatch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispositions() {
        assert_eq!(
            ProcessError::RunNotFound("r1".into()).disposition(),
            MessageDisposition::Ack
        );
        assert_eq!(
            ProcessError::QueueNotFound("q".into()).disposition(),
            MessageDisposition::Nack
        );
        assert_eq!(
            ProcessError::Dispatch(anyhow::anyhow!("socket closed")).disposition(),
            MessageDisposition::Nack
        );
        assert_eq!(
            ProcessError::Repository(anyhow::anyhow!("pool timed out")).disposition(),
            MessageDisposition::Nack
        );
        assert!(!ProcessError::Disabled.reschedules());
        assert!(ProcessError::LockFailed("r1".into()).reschedules());
    }

    #[test]
    fn test_task_not_found_lists_slugs() {
        let err = ProcessError::TaskNotFound {
            identifier: "missing".into(),
            slugs: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "task missing not found among worker tasks [a, b]"
        );
    }
}
