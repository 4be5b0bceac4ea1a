//! In-memory collaborators and fixtures for testing runq.
//!
//! Every consumer seam has a recording fake here. Fakes are cheap to clone
//! and share their state, so a test keeps one clone to inspect while the
//! consumer owns another.

mod attempts;
mod fixtures;
mod repository;
mod sender;
mod tracer;

pub use attempts::{CancelledRun, RecordingAttempts, RecordingSessions, StaticVariables};
pub use fixtures::*;
pub use repository::InMemoryTaskRuns;
pub use sender::RecordingSender;
pub use tracer::{RecordedSpan, RecordingTracer};
