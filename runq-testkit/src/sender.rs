use async_trait::async_trait;
use parking_lot::Mutex;
use runq::consumer::{ServerMessage, WorkerCommand, WorkerMessageSender};
use std::sync::Arc;

/// Worker channel that records every message it is asked to send.
#[derive(Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<ServerMessage>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<ServerMessage> {
        self.sent.lock().clone()
    }

    /// Commands sent to background workers, in order.
    pub fn commands(&self) -> Vec<WorkerCommand> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                ServerMessage::BackgroundWorkerMessage { data, .. } => Some(data.clone()),
                ServerMessage::ServerReady { .. } => None,
            })
            .collect()
    }

    pub fn assert_command_count_eq(&self, expected: usize) {
        let actual = self.commands().len();
        assert_eq!(
            actual, expected,
            "Expected {} worker commands, got {}",
            expected, actual
        );
    }

    /// Make every send fail, as if the socket had closed.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl WorkerMessageSender for RecordingSender {
    async fn send(&self, message: ServerMessage) -> anyhow::Result<()> {
        if *self.failing.lock() {
            anyhow::bail!("websocket is not open");
        }
        self.sent.lock().push(message);
        Ok(())
    }
}
