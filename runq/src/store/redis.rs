//! Redis-backed store.
//!
//! Admission-changing operations run as Lua scripts, so the "check limits,
//! pop, mark in flight, rebalance parents" sequence is one atomic unit even
//! with many consumer processes. Every key is namespaced with the configured
//! prefix; parent queues store the unprefixed queue key as member so that
//! members can be parsed back by [`crate::keys::KeyProducer::describe_queue`].

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{
    AckScript, DequeueScript, EnqueueScript, NackScript, QueueStats, QueueStatsRequest,
    RunQueueStore, StoredDelivery,
};
use crate::concurrency::ConcurrencyLimits;
use crate::lease::InFlightRecord;

const ENQUEUE_LUA: &str = r#"
local queueKey = KEYS[1]
local messageKey = KEYS[2]
local envLimitKey = KEYS[3]
local visibilityKey = KEYS[4]
local queueName = ARGV[1]

if ARGV[5] ~= '' then
  redis.call('SET', envLimitKey, ARGV[5], 'NX')
end

redis.call('SET', messageKey, ARGV[3])
if redis.call('ZSCORE', visibilityKey, ARGV[2]) then
  return
end
redis.call('ZADD', queueKey, ARGV[4], ARGV[2])

local oldest = redis.call('ZRANGE', queueKey, 0, 0, 'WITHSCORES')
for i = 5, #KEYS do
  redis.call('ZADD', KEYS[i], oldest[2], queueName)
end
"#;

const DEQUEUE_LUA: &str = r#"
local queueKey = KEYS[1]
local queueLimitKey = KEYS[2]
local queueCurrentKey = KEYS[3]
local envLimitKey = KEYS[4]
local envCurrentKey = KEYS[5]
local visibilityKey = KEYS[6]
local deliveriesKey = KEYS[7]
local queueName = ARGV[1]
local messagePrefix = ARGV[2]
local now = tonumber(ARGV[4])
local visibleUntil = tonumber(ARGV[5])

local envLimit = tonumber(redis.call('GET', envLimitKey) or ARGV[3])
if redis.call('SCARD', envCurrentKey) >= envLimit then
  return nil
end

local queueLimit = tonumber(redis.call('GET', queueLimitKey) or envLimit)
if redis.call('SCARD', queueCurrentKey) >= queueLimit then
  return nil
end

local function refreshParents()
  local oldest = redis.call('ZRANGE', queueKey, 0, 0, 'WITHSCORES')
  for i = 8, #KEYS do
    if redis.call('ZSCORE', KEYS[i], queueName) then
      if #oldest == 0 then
        redis.call('ZREM', KEYS[i], queueName)
      else
        redis.call('ZADD', KEYS[i], oldest[2], queueName)
      end
    end
  end
end

local due = redis.call('ZRANGEBYSCORE', queueKey, '-inf', now, 'LIMIT', 0, 1)
if #due == 0 then
  refreshParents()
  return nil
end

local messageId = due[1]
local payload = redis.call('GET', messagePrefix .. messageId)
redis.call('ZREM', queueKey, messageId)
if not payload then
  refreshParents()
  return nil
end

redis.call('SADD', queueCurrentKey, messageId)
redis.call('SADD', envCurrentKey, messageId)
redis.call('ZADD', visibilityKey, visibleUntil, messageId)
local attempt = redis.call('HINCRBY', deliveriesKey, messageId, 1)
refreshParents()

return {messageId, payload, attempt}
"#;

const ACK_LUA: &str = r#"
local queueKey = KEYS[1]
local queueName = ARGV[1]
local messageId = ARGV[2]

local existed = redis.call('DEL', KEYS[2])
redis.call('ZREM', queueKey, messageId)
redis.call('SREM', KEYS[3], messageId)
redis.call('SREM', KEYS[4], messageId)
redis.call('ZREM', KEYS[5], messageId)
redis.call('HDEL', KEYS[6], messageId)

local oldest = redis.call('ZRANGE', queueKey, 0, 0, 'WITHSCORES')
for i = 7, #KEYS do
  if redis.call('ZSCORE', KEYS[i], queueName) then
    if #oldest == 0 then
      redis.call('ZREM', KEYS[i], queueName)
    else
      redis.call('ZADD', KEYS[i], oldest[2], queueName)
    end
  end
end

return existed
"#;

const NACK_LUA: &str = r#"
local queueKey = KEYS[1]
local visibilityKey = KEYS[5]
local queueName = ARGV[1]
local messageId = ARGV[2]

if redis.call('EXISTS', KEYS[2]) == 0 then
  return 0
end

if ARGV[4] ~= '' then
  local deadline = redis.call('ZSCORE', visibilityKey, messageId)
  if not deadline or tonumber(deadline) > tonumber(ARGV[4]) then
    return 0
  end
end

redis.call('SREM', KEYS[3], messageId)
redis.call('SREM', KEYS[4], messageId)
redis.call('ZREM', visibilityKey, messageId)
redis.call('ZADD', queueKey, ARGV[3], messageId)

local oldest = redis.call('ZRANGE', queueKey, 0, 0, 'WITHSCORES')
for i = 6, #KEYS do
  redis.call('ZADD', KEYS[i], oldest[2], queueName)
end

return 1
"#;

const EXTEND_LUA: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

/// Run queue store on a shared Redis instance.
pub struct RedisRunQueueStore {
    redis: ConnectionManager,
    prefix: String,
    enqueue: Script,
    dequeue: Script,
    ack: Script,
    nack: Script,
    extend: Script,
}

impl std::fmt::Debug for RedisRunQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRunQueueStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisRunQueueStore {
    /// Connects to Redis, namespacing every key under `prefix`.
    pub async fn connect(redis_url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            enqueue: Script::new(ENQUEUE_LUA),
            dequeue: Script::new(DEQUEUE_LUA),
            ack: Script::new(ACK_LUA),
            nack: Script::new(NACK_LUA),
            extend: Script::new(EXTEND_LUA),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl RunQueueStore for RedisRunQueueStore {
    async fn enqueue(&self, script: &EnqueueScript) -> anyhow::Result<()> {
        let mut conn = self.redis.clone();
        let mut invocation = self.enqueue.prepare_invoke();
        invocation
            .key(self.key(&script.keys.queue))
            .key(self.key(&script.message_keys.message))
            .key(self.key(&script.keys.env_limit))
            .key(self.key(&script.message_keys.visibility));
        for parent in &script.keys.parents {
            invocation.key(self.key(parent));
        }
        invocation
            .arg(&script.keys.queue)
            .arg(&script.message_id)
            .arg(&script.payload)
            .arg(script.score)
            .arg(
                script
                    .env_limit_seed
                    .map(|limit| limit.to_string())
                    .unwrap_or_default(),
            );

        invocation.invoke_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn dequeue(&self, script: &DequeueScript) -> anyhow::Result<Option<StoredDelivery>> {
        let mut conn = self.redis.clone();
        let keys = &script.keys;
        let mut invocation = self.dequeue.prepare_invoke();
        invocation
            .key(self.key(&keys.queue))
            .key(self.key(&keys.queue_limit))
            .key(self.key(&keys.queue_current))
            .key(self.key(&keys.env_limit))
            .key(self.key(&keys.env_current))
            .key(self.key(&script.visibility_key))
            .key(self.key(&script.deliveries_key));
        for parent in &keys.parents {
            invocation.key(self.key(parent));
        }
        invocation
            .arg(&keys.queue)
            .arg(self.key(&script.message_key_prefix))
            .arg(script.default_env_limit)
            .arg(script.now)
            .arg(script.visible_until);

        let result: Option<(String, String, u32)> = invocation.invoke_async(&mut conn).await?;
        Ok(result.map(|(message_id, payload, attempt)| StoredDelivery {
            message_id,
            payload,
            attempt,
        }))
    }

    async fn acknowledge(&self, script: &AckScript) -> anyhow::Result<bool> {
        let mut conn = self.redis.clone();
        let mut invocation = self.ack.prepare_invoke();
        invocation
            .key(self.key(&script.keys.queue))
            .key(self.key(&script.message_keys.message))
            .key(self.key(&script.keys.queue_current))
            .key(self.key(&script.keys.env_current))
            .key(self.key(&script.message_keys.visibility))
            .key(self.key(&script.message_keys.deliveries));
        for parent in &script.keys.parents {
            invocation.key(self.key(parent));
        }
        invocation.arg(&script.keys.queue).arg(&script.message_id);

        let existed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(existed > 0)
    }

    async fn nack(&self, script: &NackScript) -> anyhow::Result<bool> {
        let mut conn = self.redis.clone();
        let mut invocation = self.nack.prepare_invoke();
        invocation
            .key(self.key(&script.keys.queue))
            .key(self.key(&script.message_keys.message))
            .key(self.key(&script.keys.queue_current))
            .key(self.key(&script.keys.env_current))
            .key(self.key(&script.message_keys.visibility));
        for parent in &script.keys.parents {
            invocation.key(self.key(parent));
        }
        invocation
            .arg(&script.keys.queue)
            .arg(&script.message_id)
            .arg(script.score)
            .arg(
                script
                    .expired_at
                    .map(|at| at.to_string())
                    .unwrap_or_default(),
            );

        let requeued: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(requeued > 0)
    }

    async fn extend_visibility(
        &self,
        visibility_key: &str,
        message_id: &str,
        visible_until: i64,
    ) -> anyhow::Result<bool> {
        let mut conn = self.redis.clone();
        let extended: i64 = self
            .extend
            .key(self.key(visibility_key))
            .arg(message_id)
            .arg(visible_until)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended > 0)
    }

    async fn discard_in_flight(
        &self,
        visibility_key: &str,
        deliveries_key: &str,
        message_id: &str,
    ) -> anyhow::Result<bool> {
        let mut conn = self.redis.clone();
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .zrem(self.key(visibility_key), message_id)
            .hdel(self.key(deliveries_key), message_id)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn in_flight(
        &self,
        visibility_key: &str,
        deliveries_key: &str,
        message_id: &str,
    ) -> anyhow::Result<Option<InFlightRecord>> {
        let mut conn = self.redis.clone();
        let deadline: Option<f64> = conn.zscore(self.key(visibility_key), message_id).await?;
        let Some(deadline) = deadline else {
            return Ok(None);
        };
        let attempt: Option<u32> = conn.hget(self.key(deliveries_key), message_id).await?;

        Ok(Some(InFlightRecord {
            message_id: message_id.to_string(),
            visible_until: deadline as i64,
            attempt: attempt.unwrap_or(0),
        }))
    }

    async fn expired(
        &self,
        visibility_key: &str,
        now: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(self.key(visibility_key), "-inf", now, 0, limit as isize)
            .await?;
        Ok(ids)
    }

    async fn read_message(&self, message_key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.redis.clone();
        Ok(conn.get(self.key(message_key)).await?)
    }

    async fn get_limit(&self, key: &str) -> anyhow::Result<Option<u32>> {
        let mut conn = self.redis.clone();
        Ok(conn.get(self.key(key)).await?)
    }

    async fn set_limit(&self, key: &str, limit: u32) -> anyhow::Result<()> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.key(key), limit).await?;
        Ok(())
    }

    async fn remove_limit(&self, key: &str) -> anyhow::Result<u64> {
        let mut conn = self.redis.clone();
        Ok(conn.del(self.key(key)).await?)
    }

    async fn concurrency(&self, key: &str) -> anyhow::Result<u64> {
        let mut conn = self.redis.clone();
        Ok(conn.scard(self.key(key)).await?)
    }

    async fn queue_length(&self, queue_key: &str) -> anyhow::Result<u64> {
        let mut conn = self.redis.clone();
        Ok(conn.zcard(self.key(queue_key)).await?)
    }

    async fn oldest_score(&self, queue_key: &str) -> anyhow::Result<Option<i64>> {
        let mut conn = self.redis.clone();
        let oldest: Vec<(String, f64)> = conn.zrange_withscores(self.key(queue_key), 0, 0).await?;
        Ok(oldest.first().map(|(_, score)| *score as i64))
    }

    async fn parent_range(
        &self,
        parent_key: &str,
        offset: usize,
        count: usize,
    ) -> anyhow::Result<Vec<(String, i64)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let stop = offset + count - 1;
        let members: Vec<(String, f64)> = conn
            .zrange_withscores(self.key(parent_key), offset as isize, stop as isize)
            .await?;
        Ok(members
            .into_iter()
            .map(|(queue, score)| (queue, score as i64))
            .collect())
    }

    async fn parent_length(&self, parent_key: &str) -> anyhow::Result<u64> {
        let mut conn = self.redis.clone();
        Ok(conn.zcard(self.key(parent_key)).await?)
    }

    async fn queue_stats(&self, requests: &[QueueStatsRequest]) -> anyhow::Result<Vec<QueueStats>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for request in requests {
            let keys = &request.keys;
            pipe.zcard(self.key(&keys.queue))
                .get(self.key(&keys.env_limit))
                .get(self.key(&keys.queue_limit))
                .scard(self.key(&keys.queue_current))
                .scard(self.key(&keys.env_current));
        }
        let values: Vec<Option<u64>> = pipe.query_async(&mut conn).await?;

        Ok(requests
            .iter()
            .zip(values.chunks(5))
            .map(|(request, row)| {
                let field = |i: usize| row.get(i).copied().flatten();
                let limits = ConcurrencyLimits::new(request.default_env_limit)
                    .with_env_limit(field(1).map(|v| v as u32))
                    .with_queue_override(field(2).map(|v| v as u32));
                QueueStats {
                    size: field(0).unwrap_or(0),
                    capacities: limits
                        .capacities(field(3).unwrap_or(0), field(4).unwrap_or(0)),
                }
            })
            .collect())
    }
}
