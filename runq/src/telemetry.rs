//! Tracing and telemetry instrumentation for runq.
//!
//! Span helpers for the run queue operations, `record_*` helpers that log an
//! event and, with the `metrics` feature, bump the matching Prometheus
//! metric, and the [`ConsumerTracer`] seam the queue consumer uses to open
//! its batch spans.

use tracing::{field, info_span, Span};

use crate::message::Environment;

/// Span attribute carrying successful completions in the current batch.
pub const PERIOD_SUCCESSES: &str = "tasks.period.successes";
/// Span attribute carrying failures in the current batch.
pub const PERIOD_FAILURES: &str = "tasks.period.failures";

#[must_use]
pub fn enqueue_span(queue: impl AsRef<str>, message_id: impl AsRef<str>) -> Span {
    info_span!(
        "runq.enqueue",
        queue = %queue.as_ref(),
        message_id = %message_id.as_ref(),
    )
}

/// Span for one dequeue. `path` is `env` or `shared`, `scope` the env id or
/// consumer id.
#[must_use]
pub fn dequeue_span(path: &'static str, scope: impl AsRef<str>) -> Span {
    info_span!(
        "runq.dequeue",
        path = path,
        scope = %scope.as_ref(),
        message_id = field::Empty,
    )
}

#[must_use]
pub fn ack_span(message_id: impl AsRef<str>) -> Span {
    info_span!("runq.ack", message_id = %message_id.as_ref())
}

#[must_use]
pub fn nack_span(message_id: impl AsRef<str>) -> Span {
    info_span!("runq.nack", message_id = %message_id.as_ref())
}

#[must_use]
pub fn heartbeat_span(message_id: impl AsRef<str>, seconds: u64) -> Span {
    info_span!(
        "runq.heartbeat",
        message_id = %message_id.as_ref(),
        seconds = seconds,
    )
}

/// Span for taking one dequeued message through the consumer pipeline.
#[must_use]
pub fn dispatch_span(message_id: impl AsRef<str>, env_id: impl AsRef<str>) -> Span {
    info_span!(
        "runq.dispatch",
        message_id = %message_id.as_ref(),
        env_id = %env_id.as_ref(),
        worker_id = field::Empty,
        task = field::Empty,
    )
}

pub fn record_enqueued(queue: &str, env_type: &str) {
    tracing::debug!(queue = %queue, env_type = %env_type, "message enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_enqueued(env_type);
}

pub fn record_dequeued(path: &'static str, queue: &str, message_id: &str, elapsed: std::time::Duration) {
    tracing::debug!(
        path = path,
        queue = %queue,
        message_id = %message_id,
        elapsed_ms = elapsed.as_millis() as u64,
        "message dequeued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_dequeued(path, elapsed.as_secs_f64());
}

pub fn record_acknowledged(message_id: &str) {
    tracing::debug!(message_id = %message_id, "message acknowledged");

    #[cfg(feature = "metrics")]
    crate::metrics::record_acknowledged();
}

pub fn record_nacked(message_id: &str, reason: &'static str) {
    tracing::debug!(message_id = %message_id, reason = reason, "message requeued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_nacked(reason);
}

pub fn record_visibility_expired(message_id: &str) {
    tracing::warn!(message_id = %message_id, "visibility timeout expired, message requeued");

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_visibility_expired();
        crate::metrics::record_nacked("expired");
    }
}

pub fn record_consumer_outcome(message_id: &str, outcome: &'static str) {
    tracing::debug!(message_id = %message_id, outcome = outcome, "consumer handled message");

    #[cfg(feature = "metrics")]
    crate::metrics::record_consumer_outcome(outcome);
}

/// A span opened by a [`ConsumerTracer`].
pub trait ConsumerSpan: Send + Sync {
    fn set_attribute(&mut self, key: &str, value: i64);

    fn record_exception(&mut self, error: &str);

    fn end(self: Box<Self>);
}

/// Opens the batch spans a queue consumer groups its iterations under.
pub trait ConsumerTracer: Send + Sync {
    fn start_span(&self, name: &str, env: &Environment) -> Box<dyn ConsumerSpan>;
}

/// [`ConsumerTracer`] backed by `tracing` spans.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingConsumerTracer;

impl ConsumerTracer for TracingConsumerTracer {
    fn start_span(&self, name: &str, env: &Environment) -> Box<dyn ConsumerSpan> {
        let span = info_span!(
            "runq.consumer.batch",
            batch = %name,
            env_id = %env.id,
            org_id = %env.organization_id,
            tasks.period.successes = field::Empty,
            tasks.period.failures = field::Empty,
        );
        Box::new(TracingConsumerSpan { span })
    }
}

struct TracingConsumerSpan {
    span: Span,
}

impl ConsumerSpan for TracingConsumerSpan {
    fn set_attribute(&mut self, key: &str, value: i64) {
        self.span.record(key, value);
    }

    fn record_exception(&mut self, error: &str) {
        tracing::error!(parent: &self.span, error = %error, "exception recorded");
    }

    fn end(self: Box<Self>) {
        let TracingConsumerSpan { span } = *self;
        drop(span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EnvironmentType;

    fn span_name(span: &Span) -> &'static str {
        span.metadata().map(|meta| meta.name()).unwrap_or("<disabled>")
    }

    #[test]
    fn test_dequeue_span() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = dequeue_span("shared", "consumer-1");
            assert_eq!(span_name(&span), "runq.dequeue");
        });
    }

    #[test]
    fn test_span_names() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            assert_eq!(span_name(&enqueue_span("q", "r1")), "runq.enqueue");
            assert_eq!(span_name(&ack_span("r1")), "runq.ack");
            assert_eq!(span_name(&nack_span("r1")), "runq.nack");
            assert_eq!(span_name(&heartbeat_span("r1", 30)), "runq.heartbeat");
            assert_eq!(span_name(&dispatch_span("r1", "e1")), "runq.dispatch");
        });
    }

    #[test]
    fn test_tracing_consumer_span_lifecycle() {
        let env = Environment::new("e1", EnvironmentType::Development, 10, "p1", "o1");
        let mut span = TracingConsumerTracer.start_span("DevQueueConsumer.process", &env);
        span.set_attribute(PERIOD_SUCCESSES, 3);
        span.set_attribute(PERIOD_FAILURES, 1);
        span.record_exception("socket closed");
        span.end();
    }
}
