//! Benchmarks for run queue operations using criterion.
//!
//! - Single message enqueue
//! - Shared pool dequeue across many tenant queues
//! - Concurrent consumers contending for one pool
//! - Full lifecycle (enqueue → dequeue → ack)

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use runq::{RunQueue, RunQueueConfig};
use runq_testkit::{execute_message, prod_environment, run_queue};
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fill `queues` tenant queues in the shared pool with `per_queue` messages
/// each. Limits are high enough that admission never rejects.
async fn populate(queue: &RunQueue, queues: usize, per_queue: usize) {
    let start = now_ms() - 60_000;
    for q in 0..queues {
        let env = prod_environment(&format!("env-{q}"), 100_000);
        for m in 0..per_queue {
            let message = execute_message(
                &env,
                &format!("run-{q}-{m}"),
                "bench-task",
                start + m as i64,
            );
            queue
                .enqueue_message(&env, message)
                .await
                .expect("enqueue should succeed");
        }
    }
}

fn bench_enqueue_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_single");
    group.sample_size(100);
    group.measurement_time(std::time::Duration::from_secs(10));

    group.bench_function("in_memory", |b| {
        let queue = run_queue(RunQueueConfig::new("bench"));
        let env = prod_environment("bench-env", 100_000);
        let counter = AtomicU64::new(0);

        b.to_async(&rt).iter(|| async {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            let message = execute_message(&env, &format!("run-{n}"), "bench-task", now_ms());
            queue
                .enqueue_message(&env, message)
                .await
                .expect("enqueue should succeed");
        });
    });

    group.finish();
}

/// Selection cost grows with the number of candidate queues in the window.
fn bench_shared_dequeue(c: &mut Criterion) {
    let queue_counts = vec![1, 10, 36, 100];

    let mut group = c.benchmark_group("shared_dequeue");
    group.sample_size(50);
    group.measurement_time(std::time::Duration::from_secs(15));

    for queue_count in &queue_counts {
        group.bench_with_input(
            BenchmarkId::new("tenant_queues", queue_count),
            queue_count,
            |b, &queues| {
                let rt = create_runtime();
                let queue = run_queue(RunQueueConfig::new("bench"));
                rt.block_on(populate(&queue, queues, 50));

                b.to_async(&rt).iter(|| async {
                    // Nack straight back so the pool never drains.
                    if let Some(message) = queue
                        .dequeue_message_in_shared_queue("bench-consumer")
                        .await
                        .expect("dequeue should succeed")
                    {
                        queue
                            .nack_message(&message.message_id)
                            .await
                            .expect("nack should succeed");
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_dequeue_contention(c: &mut Criterion) {
    let consumer_counts = vec![1, 5, 10, 20];

    let mut group = c.benchmark_group("dequeue_contention");
    group.sample_size(50);
    group.measurement_time(std::time::Duration::from_secs(15));

    for consumer_count in &consumer_counts {
        group.throughput(Throughput::Elements(*consumer_count as u64));
        group.bench_with_input(
            BenchmarkId::new("consumers", consumer_count),
            consumer_count,
            |b, &consumers| {
                let rt = create_runtime();
                let queue = run_queue(RunQueueConfig::new("bench"));
                rt.block_on(populate(&queue, 20, 50));

                b.to_async(&rt).iter(|| {
                    let queue = Arc::clone(&queue);
                    async move {
                        let handles: Vec<_> = (0..consumers)
                            .map(|id| {
                                let queue = Arc::clone(&queue);
                                tokio::spawn(async move {
                                    let consumer_id = format!("consumer-{id}");
                                    if let Ok(Some(message)) =
                                        queue.dequeue_message_in_shared_queue(&consumer_id).await
                                    {
                                        let _ = queue.nack_message(&message.message_id).await;
                                    }
                                })
                            })
                            .collect();
                        futures::future::join_all(handles).await;
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_full_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("full_lifecycle");
    group.sample_size(100);
    group.measurement_time(std::time::Duration::from_secs(10));

    group.bench_function("enqueue_dequeue_ack", |b| {
        let queue = run_queue(RunQueueConfig::new("bench"));
        let env = prod_environment("bench-env", 100_000);
        let counter = AtomicU64::new(0);

        b.to_async(&rt).iter(|| async {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            let message = execute_message(&env, &format!("run-{n}"), "bench-task", now_ms());
            queue
                .enqueue_message(&env, message)
                .await
                .expect("enqueue should succeed");

            let dequeued = queue
                .dequeue_message_in_shared_queue("bench-consumer")
                .await
                .expect("dequeue should succeed")
                .expect("should get a message");
            queue
                .acknowledge_message(&dequeued.message_id)
                .await
                .expect("ack should succeed");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_single,
    bench_shared_dequeue,
    bench_dequeue_contention,
    bench_full_lifecycle
);
criterion_main!(benches);
