//! Run queue integration tests.
//!
//! Limit lifecycle, private and shared dequeue, admission gating, ack/nack
//! and visibility expiry against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use runq::{
    Environment, EnvironmentType, MessagePayload, QueueChoice, RunQueueConfig, ShutdownToken,
};
use runq_testkit::{dev_environment, execute_message, init_test_tracing, prod_environment, run_queue};

fn tenant_environment(env_type: EnvironmentType) -> Environment {
    Environment::new("e1234", env_type, 10, "p1234", "o1234")
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::test]
async fn test_queue_limit_lifecycle() {
    init_test_tracing();
    let queue = run_queue(RunQueueConfig::new("test"));
    let env = tenant_environment(EnvironmentType::Production);

    assert_eq!(queue.get_queue_concurrency_limit(&env, "task/my-task").await.unwrap(), None);

    queue
        .update_queue_concurrency_limits(&env, "task/my-task", 20)
        .await
        .unwrap();
    assert_eq!(
        queue.get_queue_concurrency_limit(&env, "task/my-task").await.unwrap(),
        Some(20)
    );

    assert_eq!(
        queue.remove_queue_concurrency_limits(&env, "task/my-task").await.unwrap(),
        1
    );
    assert_eq!(queue.get_queue_concurrency_limit(&env, "task/my-task").await.unwrap(), None);
}

#[tokio::test]
async fn test_env_limit_update_and_default() {
    let queue = run_queue(RunQueueConfig::new("test").with_default_env_concurrency(7));
    let env = tenant_environment(EnvironmentType::Production);

    assert_eq!(queue.get_env_concurrency_limit(&env).await.unwrap(), 7);

    queue.update_env_concurrency_limits(&env).await.unwrap();
    assert_eq!(queue.get_env_concurrency_limit(&env).await.unwrap(), 10);
}

#[tokio::test]
async fn test_dev_environment_dequeue() {
    init_test_tracing();
    let queue = run_queue(RunQueueConfig::new("test"));
    let env = tenant_environment(EnvironmentType::Development);
    let message = MessagePayload::execute(&env, "r4321", "my-task", "task/my-task");

    assert_eq!(queue.length_of_queue(&env, "task/my-task", None).await.unwrap(), 0);
    queue.enqueue_message(&env, message).await.unwrap();
    assert_eq!(queue.length_of_queue(&env, "task/my-task", None).await.unwrap(), 1);

    let dequeued = queue.dequeue_message_in_env(&env).await.unwrap().unwrap();
    assert_eq!(dequeued.message_id, "r4321");
    assert_eq!(dequeued.message.task_identifier, "my-task");

    assert!(queue.dequeue_message_in_env(&env).await.unwrap().is_none());
    assert_eq!(queue.length_of_queue(&env, "task/my-task", None).await.unwrap(), 0);
    assert_eq!(queue.current_concurrency_of_env(&env).await.unwrap(), 1);
}

#[tokio::test]
async fn test_dev_messages_stay_out_of_shared_pool() {
    let queue = run_queue(RunQueueConfig::new("test"));
    let env = dev_environment("env_dev");

    queue
        .enqueue_message(&env, execute_message(&env, "r1", "my-task", now_ms()))
        .await
        .unwrap();

    assert_eq!(queue.get_shared_queue_details().await.unwrap().queue_count, 0);
    assert!(queue.dequeue_message_in_shared_queue("consumer-1").await.unwrap().is_none());
    assert!(queue.dequeue_message_in_env(&env).await.unwrap().is_some());
}

#[tokio::test]
async fn test_shared_pool_production_dequeue() {
    init_test_tracing();
    let queue = run_queue(RunQueueConfig::new("test"));
    let env = tenant_environment(EnvironmentType::Production);
    let message = MessagePayload::execute(&env, "r4321", "my-task", "task/my-task");
    let timestamp = message.timestamp;

    queue.enqueue_message(&env, message).await.unwrap();

    let details = queue.get_shared_queue_details().await.unwrap();
    assert_eq!(details.selection_id, "getSharedQueueDetails");
    assert_eq!(details.queue_count, 1);
    assert_eq!(details.queues.len(), 1);
    assert_eq!(
        details.queues[0].queue,
        "{org:o1234}:proj:p1234:env:e1234:queue:task/my-task"
    );
    assert_eq!(details.queues[0].score, timestamp);
    assert_eq!(details.queues[0].size, 1);
    assert_eq!(
        details.queue_choice,
        QueueChoice::Queue("{org:o1234}:proj:p1234:env:e1234:queue:task/my-task".to_string())
    );

    let dequeued = queue
        .dequeue_message_in_shared_queue("test_12345")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dequeued.message_id, "r4321");
    assert_eq!(dequeued.attempt, 1);
    assert_eq!(queue.current_concurrency_of_queue(&env, "task/my-task", None).await.unwrap(), 1);
    assert_eq!(queue.current_concurrency_of_env(&env).await.unwrap(), 1);

    assert!(queue.dequeue_message_in_shared_queue("test_12345").await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_shared_pool_aborts() {
    let queue = run_queue(RunQueueConfig::new("test"));

    let details = queue.get_shared_queue_details().await.unwrap();
    assert_eq!(details.queue_count, 0);
    assert!(details.queues.is_empty());
    assert_eq!(details.queue_choice, QueueChoice::Abort);

    assert!(queue.dequeue_message_in_shared_queue("consumer-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ack_twice_leaves_same_state() {
    let queue = run_queue(RunQueueConfig::new("test"));
    let env = prod_environment("env_prod", 5);

    queue
        .enqueue_message(&env, execute_message(&env, "r1", "my-task", now_ms()))
        .await
        .unwrap();
    queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();

    assert!(queue.acknowledge_message("r1").await.unwrap());
    let after_first = (
        queue.current_concurrency_of_env(&env).await.unwrap(),
        queue.length_of_queue(&env, "task/my-task", None).await.unwrap(),
        queue.get_shared_queue_details().await.unwrap().queue_count,
    );

    assert!(!queue.acknowledge_message("r1").await.unwrap());
    let after_second = (
        queue.current_concurrency_of_env(&env).await.unwrap(),
        queue.length_of_queue(&env, "task/my-task", None).await.unwrap(),
        queue.get_shared_queue_details().await.unwrap().queue_count,
    );

    assert_eq!(after_first, (0, 0, 0));
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn test_reenqueue_while_in_flight_is_not_delivered_twice() {
    let queue = run_queue(RunQueueConfig::new("test"));
    let env = prod_environment("env_prod", 5);

    queue
        .enqueue_message(&env, execute_message(&env, "r1", "my-task", now_ms() - 10))
        .await
        .unwrap();
    let first = queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();
    assert_eq!(first.message_id, "r1");

    queue
        .enqueue_message(&env, execute_message(&env, "r1", "my-task", now_ms() - 5))
        .await
        .unwrap();
    assert!(queue.dequeue_message_in_shared_queue("c1").await.unwrap().is_none());
    assert_eq!(queue.length_of_queue(&env, "task/my-task", None).await.unwrap(), 0);
    assert_eq!(queue.current_concurrency_of_env(&env).await.unwrap(), 1);

    // Once nacked, the run is deliverable again, exactly once.
    assert!(queue.nack_message("r1").await.unwrap());
    let redelivered = queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();
    assert_eq!(redelivered.message_id, "r1");
    assert!(queue.dequeue_message_in_shared_queue("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_nack_makes_message_redeliverable() {
    let queue = run_queue(RunQueueConfig::new("test"));
    let env = prod_environment("env_prod", 5);

    queue
        .enqueue_message(&env, execute_message(&env, "r1", "my-task", now_ms()))
        .await
        .unwrap();
    let first = queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();

    assert!(queue.nack_message(&first.message_id).await.unwrap());
    assert_eq!(queue.current_concurrency_of_env(&env).await.unwrap(), 0);

    let again = queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();
    assert_eq!(again.message_id, "r1");
    assert_eq!(again.attempt, 2);
}

#[tokio::test]
async fn test_queue_limit_gates_dequeue_until_slot_frees() {
    let queue = run_queue(RunQueueConfig::new("test"));
    let env = prod_environment("env_prod", 10);
    let start = now_ms() - 1_000;

    queue.update_queue_concurrency_limits(&env, "task/my-task", 1).await.unwrap();
    for (i, run_id) in ["r1", "r2"].into_iter().enumerate() {
        queue
            .enqueue_message(&env, execute_message(&env, run_id, "my-task", start + i as i64))
            .await
            .unwrap();
    }

    let first = queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();
    assert_eq!(first.message_id, "r1");
    assert!(queue.dequeue_message_in_shared_queue("c1").await.unwrap().is_none());
    assert_eq!(queue.length_of_queue(&env, "task/my-task", None).await.unwrap(), 1);

    queue.acknowledge_message("r1").await.unwrap();
    let second = queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();
    assert_eq!(second.message_id, "r2");
}

#[tokio::test]
async fn test_env_limit_spans_queues() {
    let queue = run_queue(RunQueueConfig::new("test"));
    let env = prod_environment("env_prod", 2);
    let start = now_ms() - 1_000;

    for (i, task) in ["a", "b", "c"].into_iter().enumerate() {
        queue
            .enqueue_message(&env, execute_message(&env, &format!("r-{task}"), task, start + i as i64))
            .await
            .unwrap();
    }

    let mut seen = HashSet::new();
    while let Some(message) = queue.dequeue_message_in_shared_queue("c1").await.unwrap() {
        seen.insert(message.message_id);
    }
    assert_eq!(seen.len(), 2);
    assert_eq!(queue.current_concurrency_of_env(&env).await.unwrap(), 2);
}

#[tokio::test]
async fn test_tenants_do_not_block_each_other() {
    let queue = run_queue(RunQueueConfig::new("test"));
    let busy = prod_environment("env_busy", 1);
    let quiet = prod_environment("env_quiet", 1);
    let start = now_ms() - 10_000;

    for i in 0..5 {
        queue
            .enqueue_message(&busy, execute_message(&busy, &format!("busy-{i}"), "work", start + i))
            .await
            .unwrap();
    }
    queue
        .enqueue_message(&quiet, execute_message(&quiet, "quiet-0", "work", now_ms()))
        .await
        .unwrap();

    let mut delivered = Vec::new();
    while let Some(message) = queue.dequeue_message_in_shared_queue("c1").await.unwrap() {
        delivered.push(message.message_id);
    }

    delivered.sort();
    assert_eq!(delivered, vec!["busy-0".to_string(), "quiet-0".to_string()]);
}

#[tokio::test]
async fn test_concurrent_consumers_never_exceed_limit() {
    let queue = run_queue(RunQueueConfig::new("test"));
    let env = prod_environment("env_prod", 3);
    let start = now_ms() - 1_000;

    for i in 0..20 {
        queue
            .enqueue_message(&env, execute_message(&env, &format!("r{i}"), "my-task", start + i))
            .await
            .unwrap();
    }

    let consumers = (0..8).map(|i| {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            queue
                .dequeue_message_in_shared_queue(&format!("consumer-{i}"))
                .await
                .unwrap()
        })
    });
    let results = futures::future::join_all(consumers).await;

    let delivered: Vec<_> = results
        .into_iter()
        .filter_map(|result| result.unwrap())
        .collect();
    assert_eq!(delivered.len(), 3);
    assert_eq!(queue.current_concurrency_of_env(&env).await.unwrap(), 3);
}

#[tokio::test]
async fn test_expired_visibility_redelivers() {
    let queue = run_queue(RunQueueConfig::new("test").with_visibility_timeout(30));
    let env = prod_environment("env_prod", 1);

    queue
        .enqueue_message(&env, execute_message(&env, "r1", "my-task", now_ms()))
        .await
        .unwrap();
    let first = queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();
    assert!(queue.dequeue_message_in_shared_queue("c1").await.unwrap().is_none());

    let record = queue.in_flight("r1").await.unwrap().unwrap();
    assert_eq!(record.visible_until, first.visible_until);
    assert_eq!(record.attempt, 1);

    assert_eq!(
        queue.reclaim_expired_messages_at(first.visible_until + 1).await.unwrap(),
        1
    );
    assert!(queue.in_flight("r1").await.unwrap().is_none());

    let again = queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();
    assert_eq!(again.message_id, "r1");
    assert_eq!(again.attempt, 2);
}

#[tokio::test]
async fn test_heartbeat_keeps_message_in_flight() {
    let queue = run_queue(RunQueueConfig::new("test").with_visibility_timeout(30));
    let env = prod_environment("env_prod", 1);

    queue
        .enqueue_message(&env, execute_message(&env, "r1", "my-task", now_ms()))
        .await
        .unwrap();
    let first = queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();

    assert!(queue.heartbeat_message("r1", 3_600).await.unwrap());
    assert_eq!(
        queue.reclaim_expired_messages_at(first.visible_until + 1).await.unwrap(),
        0
    );
    assert!(queue.in_flight("r1").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_reclaimer_task_redelivers_in_background() {
    let queue = run_queue(
        RunQueueConfig::new("test")
            .with_visibility_timeout(0)
            .with_reclaim_interval(50),
    );
    let env = prod_environment("env_prod", 1);
    queue
        .enqueue_message(&env, execute_message(&env, "r1", "my-task", now_ms()))
        .await
        .unwrap();
    queue.dequeue_message_in_shared_queue("c1").await.unwrap().unwrap();

    let shutdown = ShutdownToken::new();
    let reclaimer = queue.spawn_visibility_reclaimer(shutdown.clone());

    // Wall-clock deadline must pass too.
    std::thread::sleep(Duration::from_millis(5));
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(queue.in_flight("r1").await.unwrap().is_none());
    assert_eq!(queue.length_of_queue(&env, "task/my-task", None).await.unwrap(), 1);

    shutdown.cancel();
    reclaimer.await.unwrap();
}
