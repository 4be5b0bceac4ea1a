use parking_lot::Mutex;
use runq::{ConsumerSpan, ConsumerTracer, Environment};
use std::sync::Arc;

/// A span the [`RecordingTracer`] saw end.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordedSpan {
    pub name: String,
    pub env_id: String,
    pub attributes: Vec<(String, i64)>,
    pub exceptions: Vec<String>,
}

impl RecordedSpan {
    pub fn attribute(&self, key: &str) -> Option<i64> {
        self.attributes
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .map(|(_, value)| *value)
    }
}

#[derive(Default)]
struct TracerLog {
    started: usize,
    ended: Vec<RecordedSpan>,
}

/// Tracer that keeps every span it opened.
#[derive(Clone, Default)]
pub struct RecordingTracer {
    log: Arc<Mutex<TracerLog>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> usize {
        self.log.lock().started
    }

    pub fn ended(&self) -> Vec<RecordedSpan> {
        self.log.lock().ended.clone()
    }
}

impl ConsumerTracer for RecordingTracer {
    fn start_span(&self, name: &str, env: &Environment) -> Box<dyn ConsumerSpan> {
        self.log.lock().started += 1;
        Box::new(RecordingSpan {
            log: Arc::clone(&self.log),
            span: RecordedSpan {
                name: name.to_string(),
                env_id: env.id.clone(),
                ..RecordedSpan::default()
            },
        })
    }
}

struct RecordingSpan {
    log: Arc<Mutex<TracerLog>>,
    span: RecordedSpan,
}

impl ConsumerSpan for RecordingSpan {
    fn set_attribute(&mut self, key: &str, value: i64) {
        self.span.attributes.push((key.to_string(), value));
    }

    fn record_exception(&mut self, error: &str) {
        self.span.exceptions.push(error.to_string());
    }

    fn end(self: Box<Self>) {
        let RecordingSpan { log, span } = *self;
        log.lock().ended.push(span);
    }
}
