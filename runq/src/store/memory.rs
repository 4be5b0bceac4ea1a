use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::{
    AckScript, DequeueScript, EnqueueScript, NackScript, QueueStats, QueueStatsRequest,
    RunQueueStore, StoredDelivery,
};
use crate::concurrency::ConcurrencyLimits;
use crate::keys::QueueKeys;
use crate::lease::InFlightRecord;

/// Sorted set with unique members, ordered by `(score, member)`.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(previous, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn score(&self, member: &str) -> Option<i64> {
        self.scores.get(member).copied()
    }

    fn first(&self) -> Option<(i64, &str)> {
        self.ordered
            .first()
            .map(|(score, member)| (*score, member.as_str()))
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    fn up_to(&self, max_score: i64, limit: usize) -> Vec<String> {
        self.ordered
            .iter()
            .take_while(|(score, _)| *score <= max_score)
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect()
    }

    fn page(&self, offset: usize, count: usize) -> Vec<(String, i64)> {
        self.ordered
            .iter()
            .skip(offset)
            .take(count)
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }
}

/// The data the scripts operate on, mirroring the Redis types each key maps to.
#[derive(Debug, Default)]
struct Keyspace {
    sorted: HashMap<String, SortedSet>,
    sets: HashMap<String, HashSet<String>>,
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, u32>>,
}

impl Keyspace {
    fn zadd(&mut self, key: &str, member: &str, score: i64) {
        self.sorted
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sorted.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sorted.remove(key);
        }
        removed
    }

    fn zscore(&self, key: &str, member: &str) -> Option<i64> {
        self.sorted.get(key).and_then(|set| set.score(member))
    }

    fn zcard(&self, key: &str) -> u64 {
        self.sorted.get(key).map_or(0, |set| set.len() as u64)
    }

    fn zfirst(&self, key: &str) -> Option<(i64, String)> {
        self.sorted
            .get(key)
            .and_then(|set| set.first())
            .map(|(score, member)| (score, member.to_string()))
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.sets.remove(key);
            }
        }
    }

    fn scard(&self, key: &str) -> u64 {
        self.sets.get(key).map_or(0, |set| set.len() as u64)
    }

    fn limit(&self, key: &str) -> Option<u32> {
        self.strings.get(key).and_then(|raw| raw.parse().ok())
    }

    fn hincr(&mut self, key: &str, field: &str) -> u32 {
        let count = self
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    fn hget(&self, key: &str, field: &str) -> Option<u32> {
        self.hashes.get(key).and_then(|hash| hash.get(field)).copied()
    }

    fn hdel(&mut self, key: &str, field: &str) {
        if let Some(hash) = self.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                self.hashes.remove(key);
            }
        }
    }

    fn limits(&self, keys: &QueueKeys, default_env_limit: u32) -> ConcurrencyLimits {
        ConcurrencyLimits::new(default_env_limit)
            .with_env_limit(self.limit(&keys.env_limit))
            .with_queue_override(self.limit(&keys.queue_limit))
    }

    /// Index the queue in every parent at its oldest score, or drop it from
    /// the parents when it is empty.
    fn attach_parents(&mut self, keys: &QueueKeys) {
        let oldest = self.zfirst(&keys.queue).map(|(score, _)| score);
        for parent in &keys.parents {
            match oldest {
                Some(score) => self.zadd(parent, &keys.queue, score),
                None => {
                    self.zrem(parent, &keys.queue);
                }
            }
        }
    }

    /// Like [`Keyspace::attach_parents`] but only touches parents that
    /// already index the queue.
    fn refresh_parents(&mut self, keys: &QueueKeys) {
        let oldest = self.zfirst(&keys.queue).map(|(score, _)| score);
        for parent in &keys.parents {
            if self.zscore(parent, &keys.queue).is_none() {
                continue;
            }
            match oldest {
                Some(score) => self.zadd(parent, &keys.queue, score),
                None => {
                    self.zrem(parent, &keys.queue);
                }
            }
        }
    }

    fn release(&mut self, keys: &QueueKeys, message_id: &str, visibility_key: &str) {
        self.srem(&keys.queue_current, message_id);
        self.srem(&keys.env_current, message_id);
        self.zrem(visibility_key, message_id);
    }
}

/// Process-local store. Each script runs inside one critical section, which
/// gives it the same all-or-nothing behaviour a Lua script has on Redis.
#[derive(Default)]
pub struct InMemoryRunQueueStore {
    keyspace: Mutex<Keyspace>,
}

impl std::fmt::Debug for InMemoryRunQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryRunQueueStore");

        match self.keyspace.try_lock() {
            Some(keyspace) => {
                debug.field("sorted_sets", &keyspace.sorted.len());
                debug.field("messages", &keyspace.strings.len());
            }
            None => {
                debug.field("keyspace", &"<locked>");
            }
        }

        debug.finish_non_exhaustive()
    }
}

impl InMemoryRunQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunQueueStore for InMemoryRunQueueStore {
    async fn enqueue(&self, script: &EnqueueScript) -> anyhow::Result<()> {
        let mut ks = self.keyspace.lock();

        if let Some(seed) = script.env_limit_seed {
            ks.strings
                .entry(script.keys.env_limit.clone())
                .or_insert_with(|| seed.to_string());
        }

        ks.strings
            .insert(script.message_keys.message.clone(), script.payload.clone());
        if ks.zscore(&script.message_keys.visibility, &script.message_id).is_some() {
            return Ok(());
        }
        ks.zadd(&script.keys.queue, &script.message_id, script.score);
        ks.attach_parents(&script.keys);
        Ok(())
    }

    async fn dequeue(&self, script: &DequeueScript) -> anyhow::Result<Option<StoredDelivery>> {
        let mut ks = self.keyspace.lock();
        let keys = &script.keys;

        let limits = ks.limits(keys, script.default_env_limit);
        let capacities = limits.capacities(ks.scard(&keys.queue_current), ks.scard(&keys.env_current));
        if capacities.is_at_capacity() {
            return Ok(None);
        }

        let Some((score, message_id)) = ks.zfirst(&keys.queue) else {
            ks.refresh_parents(keys);
            return Ok(None);
        };
        if score > script.now {
            return Ok(None);
        }

        let message_key = format!("{}{}", script.message_key_prefix, message_id);
        let Some(payload) = ks.strings.get(&message_key).cloned() else {
            tracing::warn!(message_id = %message_id, queue = %keys.queue, "dropping queue entry without payload");
            ks.zrem(&keys.queue, &message_id);
            ks.refresh_parents(keys);
            return Ok(None);
        };

        ks.zrem(&keys.queue, &message_id);
        ks.sadd(&keys.queue_current, &message_id);
        ks.sadd(&keys.env_current, &message_id);
        ks.zadd(&script.visibility_key, &message_id, script.visible_until);
        let attempt = ks.hincr(&script.deliveries_key, &message_id);
        ks.refresh_parents(keys);

        Ok(Some(StoredDelivery {
            message_id,
            payload,
            attempt,
        }))
    }

    async fn acknowledge(&self, script: &AckScript) -> anyhow::Result<bool> {
        let mut ks = self.keyspace.lock();
        let existed = ks.strings.remove(&script.message_keys.message).is_some();

        ks.zrem(&script.keys.queue, &script.message_id);
        ks.release(&script.keys, &script.message_id, &script.message_keys.visibility);
        ks.hdel(&script.message_keys.deliveries, &script.message_id);
        ks.refresh_parents(&script.keys);
        Ok(existed)
    }

    async fn nack(&self, script: &NackScript) -> anyhow::Result<bool> {
        let mut ks = self.keyspace.lock();

        if !ks.strings.contains_key(&script.message_keys.message) {
            return Ok(false);
        }
        if let Some(expired_at) = script.expired_at {
            match ks.zscore(&script.message_keys.visibility, &script.message_id) {
                Some(deadline) if deadline <= expired_at => {}
                _ => return Ok(false),
            }
        }

        ks.release(&script.keys, &script.message_id, &script.message_keys.visibility);
        ks.zadd(&script.keys.queue, &script.message_id, script.score);
        ks.attach_parents(&script.keys);
        Ok(true)
    }

    async fn extend_visibility(
        &self,
        visibility_key: &str,
        message_id: &str,
        visible_until: i64,
    ) -> anyhow::Result<bool> {
        let mut ks = self.keyspace.lock();
        if ks.zscore(visibility_key, message_id).is_none() {
            return Ok(false);
        }
        ks.zadd(visibility_key, message_id, visible_until);
        Ok(true)
    }

    async fn discard_in_flight(
        &self,
        visibility_key: &str,
        deliveries_key: &str,
        message_id: &str,
    ) -> anyhow::Result<bool> {
        let mut ks = self.keyspace.lock();
        ks.hdel(deliveries_key, message_id);
        Ok(ks.zrem(visibility_key, message_id))
    }

    async fn in_flight(
        &self,
        visibility_key: &str,
        deliveries_key: &str,
        message_id: &str,
    ) -> anyhow::Result<Option<InFlightRecord>> {
        let ks = self.keyspace.lock();
        Ok(ks
            .zscore(visibility_key, message_id)
            .map(|visible_until| InFlightRecord {
                message_id: message_id.to_string(),
                visible_until,
                attempt: ks.hget(deliveries_key, message_id).unwrap_or(0),
            }))
    }

    async fn expired(
        &self,
        visibility_key: &str,
        now: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        let ks = self.keyspace.lock();
        Ok(ks
            .sorted
            .get(visibility_key)
            .map(|set| set.up_to(now, limit))
            .unwrap_or_default())
    }

    async fn read_message(&self, message_key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.keyspace.lock().strings.get(message_key).cloned())
    }

    async fn get_limit(&self, key: &str) -> anyhow::Result<Option<u32>> {
        Ok(self.keyspace.lock().limit(key))
    }

    async fn set_limit(&self, key: &str, limit: u32) -> anyhow::Result<()> {
        self.keyspace
            .lock()
            .strings
            .insert(key.to_string(), limit.to_string());
        Ok(())
    }

    async fn remove_limit(&self, key: &str) -> anyhow::Result<u64> {
        Ok(u64::from(self.keyspace.lock().strings.remove(key).is_some()))
    }

    async fn concurrency(&self, key: &str) -> anyhow::Result<u64> {
        Ok(self.keyspace.lock().scard(key))
    }

    async fn queue_length(&self, queue_key: &str) -> anyhow::Result<u64> {
        Ok(self.keyspace.lock().zcard(queue_key))
    }

    async fn oldest_score(&self, queue_key: &str) -> anyhow::Result<Option<i64>> {
        Ok(self.keyspace.lock().zfirst(queue_key).map(|(score, _)| score))
    }

    async fn parent_range(
        &self,
        parent_key: &str,
        offset: usize,
        count: usize,
    ) -> anyhow::Result<Vec<(String, i64)>> {
        let ks = self.keyspace.lock();
        Ok(ks
            .sorted
            .get(parent_key)
            .map(|set| set.page(offset, count))
            .unwrap_or_default())
    }

    async fn parent_length(&self, parent_key: &str) -> anyhow::Result<u64> {
        Ok(self.keyspace.lock().zcard(parent_key))
    }

    async fn queue_stats(&self, requests: &[QueueStatsRequest]) -> anyhow::Result<Vec<QueueStats>> {
        let ks = self.keyspace.lock();
        Ok(requests
            .iter()
            .map(|request| {
                let keys = &request.keys;
                QueueStats {
                    size: ks.zcard(&keys.queue),
                    capacities: ks
                        .limits(keys, request.default_env_limit)
                        .capacities(ks.scard(&keys.queue_current), ks.scard(&keys.env_current)),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageKeys;

    fn keys(queue: &str) -> QueueKeys {
        QueueKeys {
            queue: queue.to_string(),
            parents: vec!["parent".to_string()],
            queue_limit: format!("{queue}:concurrency"),
            queue_current: format!("{queue}:currentConcurrency"),
            env_limit: "env:concurrency".to_string(),
            env_current: "env:currentConcurrency".to_string(),
        }
    }

    fn message_keys(id: &str) -> MessageKeys {
        MessageKeys {
            message: format!("message:{id}"),
            visibility: "visibility".to_string(),
            deliveries: "deliveries".to_string(),
        }
    }

    fn enqueue(queue: &str, id: &str, score: i64) -> EnqueueScript {
        EnqueueScript {
            keys: keys(queue),
            message_keys: message_keys(id),
            message_id: id.to_string(),
            payload: format!("{{\"id\":\"{id}\"}}"),
            score,
            env_limit_seed: None,
        }
    }

    fn dequeue(queue: &str, limit: u32) -> DequeueScript {
        DequeueScript {
            keys: keys(queue),
            message_key_prefix: "message:".to_string(),
            visibility_key: "visibility".to_string(),
            deliveries_key: "deliveries".to_string(),
            default_env_limit: limit,
            now: 1_000,
            visible_until: 2_000,
        }
    }

    #[tokio::test]
    async fn test_parent_tracks_oldest_score() {
        let store = InMemoryRunQueueStore::new();
        store.enqueue(&enqueue("q", "b", 200)).await.unwrap();
        store.enqueue(&enqueue("q", "a", 100)).await.unwrap();

        assert_eq!(
            store.parent_range("parent", 0, 10).await.unwrap(),
            vec![("q".to_string(), 100)]
        );

        let delivery = store.dequeue(&dequeue("q", 10)).await.unwrap().unwrap();
        assert_eq!(delivery.message_id, "a");
        assert_eq!(delivery.attempt, 1);
        assert_eq!(
            store.parent_range("parent", 0, 10).await.unwrap(),
            vec![("q".to_string(), 200)]
        );

        store.dequeue(&dequeue("q", 10)).await.unwrap().unwrap();
        assert_eq!(store.parent_length("parent").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reenqueue_overwrites_score() {
        let store = InMemoryRunQueueStore::new();
        store.enqueue(&enqueue("q", "a", 100)).await.unwrap();
        store.enqueue(&enqueue("q", "a", 50)).await.unwrap();

        assert_eq!(store.queue_length("q").await.unwrap(), 1);
        assert_eq!(store.oldest_score("q").await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_reenqueue_of_in_flight_message_is_not_redelivered() {
        let store = InMemoryRunQueueStore::new();
        store.enqueue(&enqueue("q", "a", 100)).await.unwrap();
        store.dequeue(&dequeue("q", 10)).await.unwrap().unwrap();

        let mut again = enqueue("q", "a", 150);
        again.payload = "{\"id\":\"a\",\"v\":2}".to_string();
        store.enqueue(&again).await.unwrap();

        assert_eq!(store.queue_length("q").await.unwrap(), 0);
        assert_eq!(store.parent_length("parent").await.unwrap(), 0);
        assert!(store.dequeue(&dequeue("q", 10)).await.unwrap().is_none());
        assert_eq!(store.concurrency("q:currentConcurrency").await.unwrap(), 1);
        assert_eq!(
            store.read_message("message:a").await.unwrap().as_deref(),
            Some("{\"id\":\"a\",\"v\":2}")
        );
    }

    #[tokio::test]
    async fn test_dequeue_respects_limit_and_due_time() {
        let store = InMemoryRunQueueStore::new();
        store.enqueue(&enqueue("q", "a", 100)).await.unwrap();
        store.enqueue(&enqueue("q", "b", 100)).await.unwrap();
        store.enqueue(&enqueue("later", "c", 5_000)).await.unwrap();

        assert!(store.dequeue(&dequeue("q", 1)).await.unwrap().is_some());
        assert!(store.dequeue(&dequeue("q", 1)).await.unwrap().is_none());
        assert_eq!(store.concurrency("env:currentConcurrency").await.unwrap(), 1);

        assert!(store.dequeue(&dequeue("later", 10)).await.unwrap().is_none());
        assert_eq!(store.queue_length("later").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_guarded_nack_skips_heartbeated_message() {
        let store = InMemoryRunQueueStore::new();
        store.enqueue(&enqueue("q", "a", 100)).await.unwrap();
        store.dequeue(&dequeue("q", 10)).await.unwrap().unwrap();

        assert!(store.extend_visibility("visibility", "a", 9_000).await.unwrap());

        let nack = NackScript {
            keys: keys("q"),
            message_keys: message_keys("a"),
            message_id: "a".to_string(),
            score: 3_000,
            expired_at: Some(3_000),
        };
        assert!(!store.nack(&nack).await.unwrap());
        assert_eq!(store.concurrency("q:currentConcurrency").await.unwrap(), 1);

        let nack = NackScript {
            expired_at: Some(9_000),
            ..nack
        };
        assert!(store.nack(&nack).await.unwrap());
        assert_eq!(store.concurrency("q:currentConcurrency").await.unwrap(), 0);
        assert_eq!(store.oldest_score("q").await.unwrap(), Some(3_000));
    }

    #[tokio::test]
    async fn test_extend_visibility_requires_in_flight() {
        let store = InMemoryRunQueueStore::new();
        assert!(!store.extend_visibility("visibility", "ghost", 10).await.unwrap());
        assert!(store
            .in_flight("visibility", "deliveries", "ghost")
            .await
            .unwrap()
            .is_none());
    }
}
