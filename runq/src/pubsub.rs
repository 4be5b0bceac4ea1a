use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// A remote request to cancel one attempt running on a background worker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAttemptRequest {
    pub attempt_id: String,
    pub task_run_id: String,
}

/// Topic that carries cancellation requests for a background worker.
pub fn worker_topic(background_worker_id: &str) -> String {
    format!("backgroundWorker:{background_worker_id}:CANCEL_ATTEMPT")
}

type Release = Box<dyn FnOnce() + Send>;

/// A live subscription to one worker's cancellation topic. Dropping it
/// unsubscribes.
pub struct CancellationSubscription {
    topic: String,
    receiver: broadcast::Receiver<CancelAttemptRequest>,
    release: Option<Release>,
}

impl std::fmt::Debug for CancellationSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSubscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl Drop for CancellationSubscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl CancellationSubscription {
    pub fn new(topic: String, receiver: broadcast::Receiver<CancelAttemptRequest>) -> Self {
        Self {
            topic,
            receiver,
            release: None,
        }
    }

    /// Run `release` when the subscription is dropped, while its receiver
    /// is still counted.
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next request, or `None` once the publisher side is gone. Lagged
    /// requests are skipped with a warning.
    pub async fn recv(&mut self) -> Option<CancelAttemptRequest> {
        loop {
            match self.receiver.recv().await {
                Ok(request) => return Some(request),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %self.topic, skipped, "cancellation subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Out-of-band cancellation channel keyed by background worker.
#[async_trait]
pub trait CancellationPubSub: Send + Sync {
    async fn subscribe(&self, background_worker_id: &str) -> anyhow::Result<CancellationSubscription>;

    /// Publish a request. Returns the number of subscribers reached.
    async fn publish(
        &self,
        background_worker_id: &str,
        request: CancelAttemptRequest,
    ) -> anyhow::Result<usize>;
}

/// In-process cancellation bus on tokio broadcast channels, one channel per
/// worker topic.
///
/// Publishing never blocks; a topic without subscribers drops the request.
/// A topic is removed when its last subscription is dropped.
pub struct InProcCancellationBus {
    capacity: usize,
    topics: Arc<Mutex<Topics>>,
}

type Topics = HashMap<String, broadcast::Sender<CancelAttemptRequest>>;

fn release_topic(topics: &Weak<Mutex<Topics>>, topic: &str) {
    let Some(topics) = topics.upgrade() else {
        return;
    };
    let mut topics = topics.lock();
    if topics
        .get(topic)
        .is_some_and(|sender| sender.receiver_count() <= 1)
    {
        topics.remove(topic);
    }
}

impl std::fmt::Debug for InProcCancellationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcCancellationBus")
            .field("capacity", &self.capacity)
            .field("topics", &self.topics.lock().len())
            .finish()
    }
}

impl Default for InProcCancellationBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl InProcCancellationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Active subscriptions for a worker.
    pub fn subscriber_count(&self, background_worker_id: &str) -> usize {
        self.topics
            .lock()
            .get(&worker_topic(background_worker_id))
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Topics with at least one live subscription.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}

#[async_trait]
impl CancellationPubSub for InProcCancellationBus {
    async fn subscribe(&self, background_worker_id: &str) -> anyhow::Result<CancellationSubscription> {
        let topic = worker_topic(background_worker_id);
        let receiver = self
            .topics
            .lock()
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let topics = Arc::downgrade(&self.topics);
        let released = topic.clone();
        Ok(CancellationSubscription::new(topic, receiver)
            .with_release(move || release_topic(&topics, &released)))
    }

    async fn publish(
        &self,
        background_worker_id: &str,
        request: CancelAttemptRequest,
    ) -> anyhow::Result<usize> {
        let topic = worker_topic(background_worker_id);
        let mut topics = self.topics.lock();
        let Some(sender) = topics.get(&topic) else {
            return Ok(0);
        };
        match sender.send(request) {
            Ok(reached) => Ok(reached),
            Err(_) => {
                topics.remove(&topic);
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn request(attempt: &str) -> CancelAttemptRequest {
        CancelAttemptRequest {
            attempt_id: attempt.to_string(),
            task_run_id: "run_1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_only_worker_topic() {
        let bus = InProcCancellationBus::new(8);
        let mut worker_a = bus.subscribe("bw_a").await.unwrap();
        let mut worker_b = bus.subscribe("bw_b").await.unwrap();
        assert_eq!(worker_a.topic(), "backgroundWorker:bw_a:CANCEL_ATTEMPT");

        assert_eq!(bus.publish("bw_a", request("attempt_1")).await.unwrap(), 1);

        let received = timeout(Duration::from_secs(1), worker_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.attempt_id, "attempt_1");
        assert!(timeout(Duration::from_millis(20), worker_b.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let bus = InProcCancellationBus::default();
        let subscription = bus.subscribe("bw_a").await.unwrap();
        assert_eq!(bus.subscriber_count("bw_a"), 1);

        drop(subscription);
        assert_eq!(bus.subscriber_count("bw_a"), 0);
        assert_eq!(bus.topic_count(), 0);
        assert_eq!(bus.publish("bw_a", request("attempt_1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_topic_lives_until_last_subscription_drops() {
        let bus = InProcCancellationBus::default();
        let first = bus.subscribe("bw_a").await.unwrap();
        let mut second = bus.subscribe("bw_a").await.unwrap();
        let _other = bus.subscribe("bw_b").await.unwrap();
        assert_eq!(bus.topic_count(), 2);

        drop(first);
        assert_eq!(bus.topic_count(), 2);
        assert_eq!(bus.publish("bw_a", request("attempt_2")).await.unwrap(), 1);
        assert_eq!(second.recv().await.unwrap().attempt_id, "attempt_2");

        drop(second);
        assert_eq!(bus.topic_count(), 1);
        assert_eq!(bus.subscriber_count("bw_a"), 0);
    }
}
