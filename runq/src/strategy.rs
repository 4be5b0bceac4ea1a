use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::concurrency::QueueCapacities;

/// Window of a parent queue to sample candidates from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueRange {
    pub offset: usize,
    pub count: usize,
}

/// A child queue of a parent, with what admission knows about it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueCandidate {
    pub queue: String,
    /// Score of the oldest message in the queue.
    pub score: i64,
    /// Milliseconds since `score`.
    pub age: i64,
    /// Messages waiting in the queue.
    pub size: u64,
    pub capacities: QueueCapacities,
}

/// Outcome of a selection: a queue to try, or nothing worth trying.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum QueueChoice {
    Queue(String),
    Abort,
}

/// Chooses which queue of a parent to dequeue from next.
pub trait QueuePriorityStrategy: Send + Sync {
    /// Window of the parent the next choice for `consumer_id` samples from.
    fn next_candidate_selection(&self, parent_queue: &str, consumer_id: &str) -> QueueRange;

    /// Pick one queue among `candidates`, or [`QueueChoice::Abort`] when none
    /// has headroom.
    fn choose_queue(
        &self,
        candidates: &[QueueCandidate],
        parent_queue: &str,
        consumer_id: &str,
    ) -> QueueChoice;
}

const MAX_BONUS: f64 = 4.0;

#[derive(Clone, Copy, Debug)]
struct RangeCursor {
    /// Window handed out by the last `next_candidate_selection`.
    served: QueueRange,
    /// Window the following selection will use.
    next: QueueRange,
}

struct WeightedState {
    rng: ChaCha8Rng,
    cursors: HashMap<(String, String), RangeCursor>,
}

/// Weighted random choice favouring long and old queues.
///
/// Candidates at capacity are dropped. Every remaining queue weighs its
/// available capacity, multiplied by `1 + size bonus + age bonus`, where a
/// bonus is the ratio to the average (capped at 4) for queues above average
/// and zero otherwise. When a sampled page is full, the next selection for
/// the same consumer slides to the following page so large pools are walked
/// instead of rescanning the head.
pub struct SimpleWeightedChoiceStrategy {
    queue_selection_count: usize,
    state: Mutex<WeightedState>,
}

impl fmt::Debug for SimpleWeightedChoiceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SimpleWeightedChoiceStrategy");
        debug.field("queue_selection_count", &self.queue_selection_count);

        match self.state.try_lock() {
            Some(state) => {
                debug.field("tracked_ranges", &state.cursors.len());
            }
            None => {
                debug.field("tracked_ranges", &"<locked>");
            }
        }

        debug.finish()
    }
}

impl SimpleWeightedChoiceStrategy {
    pub fn new(queue_selection_count: usize) -> Self {
        Self::with_rng(queue_selection_count, ChaCha8Rng::from_rng(&mut rand::rng()))
    }

    /// Deterministic choices for tests and simulations.
    pub fn with_seed(queue_selection_count: usize, seed: u64) -> Self {
        Self::with_rng(queue_selection_count, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(queue_selection_count: usize, rng: ChaCha8Rng) -> Self {
        Self {
            queue_selection_count: queue_selection_count.max(1),
            state: Mutex::new(WeightedState {
                rng,
                cursors: HashMap::new(),
            }),
        }
    }

    fn weights(candidates: &[QueueCandidate]) -> Vec<(usize, f64)> {
        let eligible: Vec<(usize, &QueueCandidate)> = candidates
            .iter()
            .enumerate()
            .filter(|(_, candidate)| !candidate.capacities.is_at_capacity())
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }

        let n = eligible.len() as f64;
        let avg_size = eligible.iter().map(|(_, c)| c.size as f64).sum::<f64>() / n;
        let avg_age = eligible.iter().map(|(_, c)| c.age.max(0) as f64).sum::<f64>() / n;

        eligible
            .into_iter()
            .map(|(index, candidate)| {
                let size = candidate.size as f64;
                let age = candidate.age.max(0) as f64;
                let mut multiplier = 1.0;
                if avg_size > 0.0 && size > avg_size {
                    multiplier += (size / avg_size).min(MAX_BONUS);
                }
                if avg_age > 0.0 && age > avg_age {
                    multiplier += (age / avg_age).min(MAX_BONUS);
                }
                (index, candidate.capacities.available() as f64 * multiplier)
            })
            .collect()
    }

    /// Consumers currently paging through a parent beyond its first window.
    pub fn tracked_ranges(&self) -> usize {
        self.state.lock().cursors.len()
    }

    fn first_page(&self) -> QueueRange {
        QueueRange {
            offset: 0,
            count: self.queue_selection_count,
        }
    }
}

impl QueuePriorityStrategy for SimpleWeightedChoiceStrategy {
    fn next_candidate_selection(&self, parent_queue: &str, consumer_id: &str) -> QueueRange {
        let first_page = self.first_page();
        let mut state = self.state.lock();
        match state
            .cursors
            .get_mut(&(parent_queue.to_string(), consumer_id.to_string()))
        {
            Some(cursor) => {
                cursor.served = cursor.next;
                cursor.served
            }
            None => first_page,
        }
    }

    fn choose_queue(
        &self,
        candidates: &[QueueCandidate],
        parent_queue: &str,
        consumer_id: &str,
    ) -> QueueChoice {
        let first_page = self.first_page();
        let mut state = self.state.lock();

        // Only consumers paging past the first window keep a cursor.
        // Repeated choices over the same page compute the same next window.
        let key = (parent_queue.to_string(), consumer_id.to_string());
        let served = state
            .cursors
            .get(&key)
            .map_or(first_page, |cursor| cursor.served);
        if candidates.len() >= self.queue_selection_count {
            let next = QueueRange {
                offset: served.offset + self.queue_selection_count,
                count: self.queue_selection_count,
            };
            state.cursors.insert(key, RangeCursor { served, next });
        } else {
            state.cursors.remove(&key);
        }

        let weights = Self::weights(candidates);
        let total: f64 = weights.iter().map(|(_, weight)| weight).sum();
        let Some(&(fallback, _)) = weights.first() else {
            return QueueChoice::Abort;
        };
        if total <= 0.0 {
            return QueueChoice::Queue(candidates[fallback].queue.clone());
        }

        let mut roll: f64 = state.rng.random_range(0.0..total);
        for (index, weight) in &weights {
            if roll < *weight {
                return QueueChoice::Queue(candidates[*index].queue.clone());
            }
            roll -= weight;
        }

        // Float rounding can leave a sliver past the last bucket.
        let (last, _) = weights[weights.len() - 1];
        QueueChoice::Queue(candidates[last].queue.clone())
    }
}
