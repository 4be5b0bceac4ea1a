//! Groups consumer iterations under long-lived batch spans.
//!
//! A span covers at most `maximum_items` iterations or `timeout` of wall
//! time, whichever comes first. When it is rotated the accumulated success
//! and failure counts are written to it before it ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::message::Environment;
use crate::telemetry::{ConsumerSpan, ConsumerTracer, PERIOD_FAILURES, PERIOD_SUCCESSES};

pub struct TraceBatcher {
    tracer: Arc<dyn ConsumerTracer>,
    span_name: String,
    maximum_items: u32,
    timeout: Duration,
    countdown: u32,
    opened_at: Instant,
    span: Option<Box<dyn ConsumerSpan>>,
    successes: i64,
    failures: i64,
    end_next: bool,
}

impl std::fmt::Debug for TraceBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceBatcher")
            .field("span_name", &self.span_name)
            .field("maximum_items", &self.maximum_items)
            .field("timeout", &self.timeout)
            .field("countdown", &self.countdown)
            .field("span_open", &self.span.is_some())
            .field("successes", &self.successes)
            .field("failures", &self.failures)
            .field("end_next", &self.end_next)
            .finish()
    }
}

impl TraceBatcher {
    pub fn new(
        tracer: Arc<dyn ConsumerTracer>,
        span_name: impl Into<String>,
        maximum_items: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            tracer,
            span_name: span_name.into(),
            maximum_items,
            timeout,
            countdown: maximum_items,
            opened_at: Instant::now(),
            span: None,
            successes: 0,
            failures: 0,
            end_next: false,
        }
    }

    /// Restart the item countdown, the time window and the counters.
    pub fn reset(&mut self) {
        self.countdown = self.maximum_items;
        self.opened_at = Instant::now();
        self.successes = 0;
        self.failures = 0;
    }

    pub fn needs_rotation(&self) -> bool {
        self.span.is_none()
            || self.countdown == 0
            || self.end_next
            || self.opened_at.elapsed() > self.timeout
    }

    /// Called at the start of every iteration; opens a fresh span when the
    /// current one is due for rotation.
    pub fn begin_iteration(&mut self, env: &Environment) {
        if !self.needs_rotation() {
            return;
        }

        if let Some(span) = self.span.take() {
            tracing::debug!(
                successes = self.successes,
                failures = self.failures,
                "ending consumer batch span"
            );
            self.end_span(span);
        }

        self.span = Some(self.tracer.start_span(&self.span_name, env));
        self.reset();
        self.end_next = false;
    }

    pub fn finish_iteration(&mut self) {
        self.countdown = self.countdown.saturating_sub(1);
    }

    pub fn record_success(&mut self) {
        self.successes += 1;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// Attach an error to the current span and rotate it on the next
    /// iteration.
    pub fn record_exception(&mut self, error: &str) {
        if let Some(span) = self.span.as_mut() {
            span.record_exception(error);
        }
        self.end_next = true;
    }

    /// End the current span, if any.
    pub fn close(&mut self) {
        if let Some(span) = self.span.take() {
            self.end_span(span);
        }
    }

    fn end_span(&self, mut span: Box<dyn ConsumerSpan>) {
        span.set_attribute(PERIOD_FAILURES, self.failures);
        span.set_attribute(PERIOD_SUCCESSES, self.successes);
        span.end();
    }

    pub fn successes(&self) -> i64 {
        self.successes
    }

    pub fn failures(&self) -> i64 {
        self.failures
    }

    pub fn is_open(&self) -> bool {
        self.span.is_some()
    }

    pub fn remaining_items(&self) -> u32 {
        self.countdown
    }
}
