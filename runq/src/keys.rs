//! Deterministic naming of every key the run queue touches.
//!
//! Keys are derived from `(organization, project, environment, queue)` and
//! are stable across processes, so any consumer can recompute the keys of a
//! message it only knows by id. The layout is:
//!
//! | key | format |
//! |---|---|
//! | queue | `{org:O}:proj:P:env:E:queue:Q` (`:ck:K` suffix with a concurrency key) |
//! | queue limit | `{org:O}:proj:P:env:E:queue:Q:concurrency` |
//! | queue in-flight set | `<queue key>:currentConcurrency` |
//! | env limit | `{org:O}:env:E:concurrency` |
//! | env in-flight set | `{org:O}:env:E:currentConcurrency` |
//! | env parent queue | `{org:O}:env:E:queues` |
//! | shared parent queue | `sharedQueue` |
//! | message | `message:<run id>` |

use serde::{Deserialize, Serialize};

use crate::error::RunQueueError;
use crate::message::{Environment, EnvironmentType, MessagePayload};

const SHARED_QUEUE: &str = "sharedQueue";
const VISIBILITY: &str = "visibility";
const DELIVERIES: &str = "deliveries";
const MESSAGE_PREFIX: &str = "message:";
const CONCURRENCY_KEY_PART: &str = ":ck:";
const MAX_QUEUE_NAME_LEN: usize = 128;

/// Strip everything but `[A-Za-z0-9_-./]` from a queue name and cap its length.
pub fn sanitize_queue_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
        .take(MAX_QUEUE_NAME_LEN)
        .collect()
}

/// The identity encoded in a queue key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub org_id: String,
    pub project_id: String,
    pub env_id: String,
    pub queue: String,
    pub concurrency_key: Option<String>,
}

/// Every key a single-queue store script needs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueKeys {
    pub queue: String,
    /// Parent sorted sets that index this queue by its oldest score.
    pub parents: Vec<String>,
    pub queue_limit: String,
    pub queue_current: String,
    pub env_limit: String,
    pub env_current: String,
}

/// Produces keys for queues, counters, limits and messages.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyProducer;

impl KeyProducer {
    pub fn new() -> Self {
        Self
    }

    pub fn queue_key(
        &self,
        env: &Environment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> String {
        self.queue_key_parts(
            &env.organization_id,
            &env.project_id,
            &env.id,
            queue,
            concurrency_key,
        )
    }

    pub fn queue_key_from_message(&self, message: &MessagePayload) -> String {
        self.queue_key_parts(
            &message.org_id,
            &message.project_id,
            &message.environment_id,
            &message.queue,
            message.concurrency_key.as_deref(),
        )
    }

    fn queue_key_parts(
        &self,
        org_id: &str,
        project_id: &str,
        env_id: &str,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> String {
        let base = format!(
            "{{org:{org_id}}}:proj:{project_id}:env:{env_id}:queue:{}",
            sanitize_queue_name(queue)
        );
        match concurrency_key {
            Some(ck) => format!("{base}{CONCURRENCY_KEY_PART}{ck}"),
            None => base,
        }
    }

    pub fn shared_queue_key(&self) -> &'static str {
        SHARED_QUEUE
    }

    pub fn visibility_key(&self) -> &'static str {
        VISIBILITY
    }

    pub fn deliveries_key(&self) -> &'static str {
        DELIVERIES
    }

    pub fn message_key_prefix(&self) -> &'static str {
        MESSAGE_PREFIX
    }

    pub fn message_key(&self, message_id: &str) -> String {
        format!("{MESSAGE_PREFIX}{message_id}")
    }

    pub fn env_parent_key(&self, env: &Environment) -> String {
        env_scoped(&env.organization_id, &env.id, "queues")
    }

    pub fn env_concurrency_limit_key(&self, env: &Environment) -> String {
        env_scoped(&env.organization_id, &env.id, "concurrency")
    }

    pub fn env_current_concurrency_key(&self, env: &Environment) -> String {
        env_scoped(&env.organization_id, &env.id, "currentConcurrency")
    }

    pub fn queue_concurrency_limit_key(&self, env: &Environment, queue: &str) -> String {
        format!("{}:concurrency", self.queue_key(env, queue, None))
    }

    /// Parse a queue key back into its identity.
    pub fn describe_queue(&self, queue_key: &str) -> Result<QueueDescriptor, RunQueueError> {
        let malformed = || RunQueueError::MalformedQueueKey(queue_key.to_string());

        let rest = queue_key.strip_prefix("{org:").ok_or_else(malformed)?;
        let (org_id, rest) = rest.split_once("}:proj:").ok_or_else(malformed)?;
        let (project_id, rest) = rest.split_once(":env:").ok_or_else(malformed)?;
        let (env_id, rest) = rest.split_once(":queue:").ok_or_else(malformed)?;
        let (queue, concurrency_key) = match rest.split_once(CONCURRENCY_KEY_PART) {
            Some((queue, ck)) => (queue, Some(ck.to_string())),
            None => (rest, None),
        };

        if org_id.is_empty() || env_id.is_empty() || queue.is_empty() {
            return Err(malformed());
        }

        Ok(QueueDescriptor {
            org_id: org_id.to_string(),
            project_id: project_id.to_string(),
            env_id: env_id.to_string(),
            queue: queue.to_string(),
            concurrency_key,
        })
    }

    /// Keys for a queue key, indexing it under the env parent and, when
    /// `shared` is set, the shared parent too.
    pub fn keys_for_queue(&self, queue_key: &str, shared: bool) -> Result<QueueKeys, RunQueueError> {
        let descriptor = self.describe_queue(queue_key)?;
        let base = self.queue_key_parts(
            &descriptor.org_id,
            &descriptor.project_id,
            &descriptor.env_id,
            &descriptor.queue,
            None,
        );

        let mut parents = vec![env_scoped(&descriptor.org_id, &descriptor.env_id, "queues")];
        if shared {
            parents.push(SHARED_QUEUE.to_string());
        }

        Ok(QueueKeys {
            queue: queue_key.to_string(),
            parents,
            queue_limit: format!("{base}:concurrency"),
            queue_current: format!("{queue_key}:currentConcurrency"),
            env_limit: env_scoped(&descriptor.org_id, &descriptor.env_id, "concurrency"),
            env_current: env_scoped(
                &descriptor.org_id,
                &descriptor.env_id,
                "currentConcurrency",
            ),
        })
    }

    /// Keys for the queue a message lives in. Production messages are also
    /// indexed in the shared pool.
    pub fn keys_for_message(&self, message: &MessagePayload) -> QueueKeys {
        let queue = self.queue_key_from_message(message);
        let base = self.queue_key_parts(
            &message.org_id,
            &message.project_id,
            &message.environment_id,
            &message.queue,
            None,
        );

        let mut parents = vec![env_scoped(&message.org_id, &message.environment_id, "queues")];
        if message.environment_type == EnvironmentType::Production {
            parents.push(SHARED_QUEUE.to_string());
        }

        QueueKeys {
            queue_current: format!("{queue}:currentConcurrency"),
            queue,
            parents,
            queue_limit: format!("{base}:concurrency"),
            env_limit: env_scoped(&message.org_id, &message.environment_id, "concurrency"),
            env_current: env_scoped(
                &message.org_id,
                &message.environment_id,
                "currentConcurrency",
            ),
        }
    }
}

fn env_scoped(org_id: &str, env_id: &str, suffix: &str) -> String {
    format!("{{org:{org_id}}}:env:{env_id}:{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::new("e1234", EnvironmentType::Production, 10, "p1234", "o1234")
    }

    #[test]
    fn test_queue_key_layout() {
        let keys = KeyProducer::new();
        assert_eq!(
            keys.queue_key(&env(), "task/my-task", None),
            "{org:o1234}:proj:p1234:env:e1234:queue:task/my-task"
        );
        assert_eq!(
            keys.queue_key(&env(), "task/my-task", Some("user-1")),
            "{org:o1234}:proj:p1234:env:e1234:queue:task/my-task:ck:user-1"
        );
    }

    #[test]
    fn test_describe_queue_round_trips_concurrency_key() {
        let keys = KeyProducer::new();
        let key = keys.queue_key(&env(), "task/my-task", Some("user-1"));
        let descriptor = keys.describe_queue(&key).unwrap();
        assert_eq!(descriptor.org_id, "o1234");
        assert_eq!(descriptor.project_id, "p1234");
        assert_eq!(descriptor.env_id, "e1234");
        assert_eq!(descriptor.queue, "task/my-task");
        assert_eq!(descriptor.concurrency_key.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_describe_queue_rejects_garbage() {
        let keys = KeyProducer::new();
        assert!(keys.describe_queue("sharedQueue").is_err());
        assert!(keys.describe_queue("{org:o1}:proj:p1:env:e1").is_err());
    }

    #[test]
    fn test_concurrency_keys_share_env_counters() {
        let keys = KeyProducer::new();
        let plain = keys
            .keys_for_queue(&keys.queue_key(&env(), "q", None), false)
            .unwrap();
        let keyed = keys
            .keys_for_queue(&keys.queue_key(&env(), "q", Some("a")), true)
            .unwrap();

        assert_eq!(plain.env_current, keyed.env_current);
        assert_eq!(plain.queue_limit, keyed.queue_limit);
        assert_ne!(plain.queue_current, keyed.queue_current);
        assert_eq!(plain.parents, vec!["{org:o1234}:env:e1234:queues".to_string()]);
        assert_eq!(keyed.parents.len(), 2);
    }

    #[test]
    fn test_sanitize_queue_name() {
        assert_eq!(sanitize_queue_name("task/my task!"), "task/mytask");
        assert_eq!(sanitize_queue_name(&"a".repeat(200)).len(), 128);
    }
}
