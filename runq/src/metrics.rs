//! Prometheus metrics for the run queue and its consumers.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `runq_messages_enqueued_total` - Messages enqueued, by environment type
//! - `runq_messages_dequeued_total` - Messages dequeued, by path (`env` | `shared`)
//! - `runq_messages_acknowledged_total` - Messages acknowledged
//! - `runq_messages_nacked_total` - Messages returned to their queue, by reason
//! - `runq_visibility_expired_total` - In-flight messages reclaimed after their deadline
//! - `runq_consumer_messages_total` - Consumer pipeline outcomes
//!
//! ## Histograms
//! - `runq_dequeue_duration_seconds` - Time spent in one dequeue, by path
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
};
use std::sync::LazyLock;

/// Registry holding every runq metric.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `env_type`: DEVELOPMENT, STAGING or PRODUCTION
pub static MESSAGES_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("runq_messages_enqueued_total", "Total number of messages enqueued");
    CounterVec::new(opts, &["env_type"])
        .expect("runq_messages_enqueued_total metric creation failed")
});

/// Labels:
/// - `path`: `env` for private dequeues, `shared` for the shared pool
pub static MESSAGES_DEQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("runq_messages_dequeued_total", "Total number of messages dequeued");
    CounterVec::new(opts, &["path"])
        .expect("runq_messages_dequeued_total metric creation failed")
});

pub static MESSAGES_ACKNOWLEDGED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "runq_messages_acknowledged_total",
        "Total number of messages acknowledged",
    )
    .expect("runq_messages_acknowledged_total metric creation failed")
});

/// Labels:
/// - `reason`: why the message went back (`nack`, `expired`)
pub static MESSAGES_NACKED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("runq_messages_nacked_total", "Total number of messages requeued");
    CounterVec::new(opts, &["reason"]).expect("runq_messages_nacked_total metric creation failed")
});

pub static VISIBILITY_EXPIRED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "runq_visibility_expired_total",
        "Total number of in-flight messages whose visibility timeout expired",
    )
    .expect("runq_visibility_expired_total metric creation failed")
});

/// Labels:
/// - `outcome`: `dispatched` or the failing step (`run_not_found`, `dispatch`, ...)
pub static CONSUMER_MESSAGES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runq_consumer_messages_total",
        "Total number of messages handled by queue consumers",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("runq_consumer_messages_total metric creation failed")
});

/// Labels:
/// - `path`: `env` or `shared`
pub static DEQUEUE_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.0005, 2.0, 14).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "runq_dequeue_duration_seconds",
        "Time spent selecting and popping one message",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["path"])
        .expect("runq_dequeue_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`].
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(MESSAGES_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(MESSAGES_DEQUEUED_TOTAL.clone()),
        Box::new(MESSAGES_ACKNOWLEDGED_TOTAL.clone()),
        Box::new(MESSAGES_NACKED_TOTAL.clone()),
        Box::new(VISIBILITY_EXPIRED_TOTAL.clone()),
        Box::new(CONSUMER_MESSAGES_TOTAL.clone()),
        Box::new(DEQUEUE_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_enqueued(env_type: &str) {
    MESSAGES_ENQUEUED_TOTAL.with_label_values(&[env_type]).inc();
}

pub fn record_dequeued(path: &str, duration_secs: f64) {
    MESSAGES_DEQUEUED_TOTAL.with_label_values(&[path]).inc();
    DEQUEUE_DURATION_SECONDS
        .with_label_values(&[path])
        .observe(duration_secs);
}

pub fn record_acknowledged() {
    MESSAGES_ACKNOWLEDGED_TOTAL.inc();
}

pub fn record_nacked(reason: &str) {
    MESSAGES_NACKED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_visibility_expired() {
    VISIBILITY_EXPIRED_TOTAL.inc();
}

pub fn record_consumer_outcome(outcome: &str) {
    CONSUMER_MESSAGES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_enqueued("PRODUCTION");
        record_dequeued("shared", 0.002);
        record_acknowledged();
        record_nacked("expired");
        record_visibility_expired();
        record_consumer_outcome("dispatched");

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("runq_messages_enqueued_total"));
        assert!(output.contains("runq_dequeue_duration_seconds"));
        assert!(output.contains("runq_consumer_messages_total"));
    }
}
