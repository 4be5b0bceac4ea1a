use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::collaborators::WorkerMessageSender;
use super::dev::DevQueueConsumer;
use super::protocol::{ClientMessage, ServerMessage, WorkerEvent};
use crate::shutdown::ShutdownToken;

const INBOX_CAPACITY: usize = 64;
const DISCONNECT_REASON: &str = "worker disconnected";

/// Cloneable handle to a running [`ConsumerConnection`].
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: String,
    inbox: mpsc::Sender<ClientMessage>,
    closing: ShutdownToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hand an inbound worker message to the connection task.
    pub async fn send(&self, message: ClientMessage) -> anyhow::Result<()> {
        self.inbox
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("connection {} is closed", self.id))
    }

    /// Parse and deliver a raw JSON frame.
    pub async fn send_json(&self, raw: &str) -> anyhow::Result<()> {
        let message = ClientMessage::from_json(raw)?;
        self.send(message).await
    }

    /// Disable the consumer now and let the task tear it down. Returns
    /// `true` on the first call.
    pub fn close(&self) -> bool {
        self.closing.cancel()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }
}

/// One worker connection: owns its [`DevQueueConsumer`] and drives it from
/// a single task, interleaving inbound messages with poll iterations.
pub struct ConsumerConnection {
    id: String,
    consumer: DevQueueConsumer,
    sender: Arc<dyn WorkerMessageSender>,
    inbox: mpsc::Receiver<ClientMessage>,
    closing: ShutdownToken,
    next_poll: Option<Instant>,
}

impl std::fmt::Debug for ConsumerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerConnection")
            .field("id", &self.id)
            .field("consumer", &self.consumer)
            .field("next_poll", &self.next_poll)
            .finish_non_exhaustive()
    }
}

impl ConsumerConnection {
    pub fn new(
        consumer: DevQueueConsumer,
        sender: Arc<dyn WorkerMessageSender>,
    ) -> (Self, ConnectionHandle) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let closing = consumer.closing_token();

        let handle = ConnectionHandle {
            id: id.clone(),
            inbox: tx,
            closing: closing.clone(),
        };
        let connection = Self {
            id,
            consumer,
            sender,
            inbox: rx,
            closing,
            next_poll: None,
        };
        (connection, handle)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn consumer(&self) -> &DevQueueConsumer {
        &self.consumer
    }

    /// Tell the worker the server is ready.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.sender
            .send(ServerMessage::ServerReady {
                id: self.id.clone(),
            })
            .await
    }

    pub fn spawn(self) -> JoinHandle<DevQueueConsumer> {
        tokio::spawn(self.run())
    }

    /// Run until the handle closes the connection or every handle is
    /// dropped, then stop the consumer. Returns the stopped consumer.
    pub async fn run(mut self) -> DevQueueConsumer {
        if let Err(err) = self.initialize().await {
            tracing::warn!(connection = %self.id, "failed to send SERVER_READY: {err:#}");
        }

        loop {
            let poll_at = self.next_poll.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;
                _ = self.closing.cancelled() => break,
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(poll_at), if self.next_poll.is_some() => {
                    self.next_poll = self
                        .consumer
                        .process_iteration()
                        .await
                        .map(|delay| Instant::now() + delay);
                }
            }
        }

        tracing::debug!(connection = %self.id, "connection closed");
        self.consumer.stop(DISCONNECT_REASON).await;
        self.consumer
    }

    async fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::ReadyForTasks {
                background_worker_id,
                in_progress_runs,
            } => {
                match self
                    .consumer
                    .register_background_worker(&background_worker_id, in_progress_runs)
                    .await
                {
                    Ok(true) => self.next_poll = Some(Instant::now()),
                    Ok(false) => {}
                    Err(err) => tracing::warn!(
                        worker = %background_worker_id,
                        "failed to register background worker: {err:#}"
                    ),
                }
            }
            ClientMessage::BackgroundWorkerDeprecated {
                background_worker_id,
            } => {
                self.consumer
                    .deprecate_background_worker(&background_worker_id);
            }
            ClientMessage::BackgroundWorkerMessage {
                background_worker_id,
                data,
            } => self.handle_worker_event(&background_worker_id, data).await,
        }
    }

    async fn handle_worker_event(&mut self, worker_id: &str, event: WorkerEvent) {
        let heartbeat_secs = self.consumer.config().heartbeat_secs;

        let result = match event {
            WorkerEvent::TaskRunCompleted {
                completion,
                execution,
            } => {
                self.consumer
                    .task_attempt_completed(worker_id, &completion, &execution)
                    .await
            }
            WorkerEvent::TaskRunFailedToRun { completion } => {
                self.consumer.task_run_failed(worker_id, &completion).await
            }
            WorkerEvent::TaskHeartbeat { id } => {
                self.consumer
                    .task_heartbeat(worker_id, &id, heartbeat_secs)
                    .await;
                Ok(())
            }
            WorkerEvent::TaskRunHeartbeat { id } => {
                self.consumer
                    .task_run_heartbeat(worker_id, &id, heartbeat_secs)
                    .await;
                Ok(())
            }
        };

        if let Err(err) = result {
            tracing::warn!(worker = %worker_id, "worker message handling failed: {err:#}");
        }
    }
}
