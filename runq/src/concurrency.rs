use serde::{Deserialize, Serialize};

/// Current in-flight count against a limit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    pub current: u64,
    pub limit: u64,
}

impl Capacity {
    pub fn new(current: u64, limit: u64) -> Self {
        Self { current, limit }
    }

    /// Slots left before the limit is reached.
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.current)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current >= self.limit
    }
}

/// Queue and environment capacity seen together, the way admission sees them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueCapacities {
    pub queue: Capacity,
    pub env: Capacity,
}

impl QueueCapacities {
    pub fn new(queue: Capacity, env: Capacity) -> Self {
        Self { queue, env }
    }

    /// A queue is admissible only while both counters are under their limits.
    pub fn is_at_capacity(&self) -> bool {
        self.queue.is_exhausted() || self.env.is_exhausted()
    }

    /// The tighter of the two headrooms.
    pub fn available(&self) -> u64 {
        self.queue.available().min(self.env.available())
    }
}

/// Limits that apply to one queue: a stored environment limit (if any), the
/// configured fallback, and an optional per-queue override.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConcurrencyLimits {
    env_limit: Option<u32>,
    default_env_limit: u32,
    queue_override: Option<u32>,
}

impl ConcurrencyLimits {
    pub fn new(default_env_limit: u32) -> Self {
        Self {
            env_limit: None,
            default_env_limit,
            queue_override: None,
        }
    }

    pub fn with_env_limit(mut self, limit: Option<u32>) -> Self {
        self.env_limit = limit;
        self
    }

    pub fn with_queue_override(mut self, limit: Option<u32>) -> Self {
        self.queue_override = limit;
        self
    }

    pub fn env(&self) -> u32 {
        self.env_limit.unwrap_or(self.default_env_limit)
    }

    /// Queue limit, falling back to the environment limit when unset.
    pub fn queue(&self) -> u32 {
        self.queue_override.unwrap_or_else(|| self.env())
    }

    pub fn capacities(&self, queue_current: u64, env_current: u64) -> QueueCapacities {
        QueueCapacities::new(
            Capacity::new(queue_current, u64::from(self.queue())),
            Capacity::new(env_current, u64::from(self.env())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_fall_back_in_order() {
        let limits = ConcurrencyLimits::new(10);
        assert_eq!(limits.env(), 10);
        assert_eq!(limits.queue(), 10);

        let limits = limits.with_env_limit(Some(4));
        assert_eq!(limits.env(), 4);
        assert_eq!(limits.queue(), 4);

        let limits = limits.with_queue_override(Some(20));
        assert_eq!(limits.queue(), 20);
        assert_eq!(limits.env(), 4);
    }

    #[test]
    fn test_capacity_uses_tighter_bound() {
        let capacities = ConcurrencyLimits::new(5)
            .with_queue_override(Some(2))
            .capacities(1, 4);
        assert!(!capacities.is_at_capacity());
        assert_eq!(capacities.available(), 1);

        let capacities = ConcurrencyLimits::new(5).capacities(0, 5);
        assert!(capacities.is_at_capacity());
        assert_eq!(capacities.available(), 0);
    }

    #[test]
    fn test_zero_limit_is_always_exhausted() {
        let capacities = ConcurrencyLimits::new(0).capacities(0, 0);
        assert!(capacities.is_at_capacity());
    }

    #[test]
    fn test_available_saturates() {
        // Limits can be lowered below the in-flight count.
        assert_eq!(Capacity::new(7, 3).available(), 0);
    }
}
