//! Per-connection queue consumer for development environments.
//!
//! A [`ConsumerConnection`] owns one [`DevQueueConsumer`] and drives it from
//! a single task: inbound worker messages and poll iterations never
//! overlap. Each iteration dequeues one message from the environment's
//! queues and takes it through run lookup, worker and task resolution,
//! locking, queue lookup and dispatch. Every failing step settles the
//! message with an ack or a nack (see [`crate::error::ProcessError`]).

pub mod builder;
pub mod collaborators;
pub mod connection;
pub mod dev;
pub mod protocol;
pub mod worker;

pub use builder::QueueConsumerBuilder;
pub use collaborators::{
    AttemptCompletionState, AttemptLifecycle, BackgroundTask, BackgroundWorkerRecord,
    CancelRunOptions, EnvironmentSessions, EnvironmentVariable, RunLock, TaskQueueRecord,
    TaskRunRecord, TaskRunRepository, TaskRunStatus, VariableResolver, WorkerMessageSender,
};
pub use connection::{ConnectionHandle, ConsumerConnection};
pub use dev::{DevQueueConsumer, DispatchPayload};
pub use protocol::{
    ClientMessage, ExecutionPayload, LazyAttemptPayload, MessageBody, ServerMessage,
    TaskRunCompletion, TaskRunExecution, TaskRunFailedCompletion, WorkerCommand, WorkerEvent,
};
pub use worker::{WorkerRegistry, WorkerVersion};
