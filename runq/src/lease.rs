use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// In-flight bookkeeping for a dequeued message, as held by the store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InFlightRecord {
    /// ID of the in-flight message (the run id).
    pub message_id: String,
    /// Visibility deadline in milliseconds since the epoch.
    pub visible_until: i64,
    /// Number of deliveries so far, including the current one.
    pub attempt: u32,
}

impl InFlightRecord {
    /// Checks if the visibility window has passed at `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.visible_until <= now_ms
    }

    pub fn visible_until_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.visible_until)
    }
}

/// Deadline of a visibility window of `secs` opened at `now_ms`.
pub fn visibility_deadline(now_ms: i64, secs: u64) -> i64 {
    let window = i64::try_from(secs.saturating_mul(1_000)).unwrap_or(i64::MAX);
    now_ms.saturating_add(window)
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Result of processing one expired in-flight message during a sweep.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReclaimOutcome {
    /// Message returned to its queue.
    Requeued,
    /// Message was acked, nacked or heartbeated before the sweep reached it.
    Settled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_deadline() {
        assert_eq!(visibility_deadline(1_000, 5), 6_000);
        assert_eq!(visibility_deadline(1_000, 0), 1_000);
        assert_eq!(visibility_deadline(i64::MAX - 1, 10), i64::MAX);
    }

    #[test]
    fn test_in_flight_expiry_is_inclusive() {
        let record = InFlightRecord {
            message_id: "r1".into(),
            visible_until: 5_000,
            attempt: 1,
        };
        assert!(!record.is_expired_at(4_999));
        assert!(record.is_expired_at(5_000));
        assert!(record.visible_until_utc().is_some());
    }
}
