use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep_until};

use crate::{DEFAULT_MAX_RETRIES, Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// `interval * multiplier^(retry - 1)`, capped at `max_interval_ms`.
    Exponential { multiplier: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Used when a task has no `max_retries` in its metadata.
    pub max_retries: u32,
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff: Backoff,
    /// Fraction of the delay randomly added or removed (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            interval_ms: 5_000,
            max_interval_ms: 60_000,
            backoff: Backoff::Fixed,
            jitter: 0.0,
        }
    }
}

/// Outcome of asking the policy about a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { retry_count: u32, delay: Duration },
    Exhausted { max_retries: u32 },
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn exponential(interval: Duration, multiplier: f64) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            backoff: Backoff::Exponential { multiplier },
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Repairs out-of-range values loaded from config.
    pub fn normalized(mut self) -> Self {
        if let Backoff::Exponential { multiplier } = self.backoff {
            if !(multiplier > 0.0) {
                self.backoff = Backoff::Exponential { multiplier: 2.0 };
            }
        }
        if self.max_interval_ms < self.interval_ms {
            self.max_interval_ms = self.interval_ms;
        }
        self.jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        self
    }

    /// Decides what happens after a retryable failure of `task`, based on the
    /// `retry_count` / `max_retries` metadata it carries.
    pub fn decide(&self, task: &Task) -> RetryDecision {
        let retry_count = task.retry_count().saturating_add(1);
        let max_retries = task.max_retries().unwrap_or(self.max_retries);

        if retry_count > max_retries {
            RetryDecision::Exhausted { max_retries }
        } else {
            RetryDecision::Retry {
                retry_count,
                delay: self.delay_for(retry_count),
            }
        }
    }

    /// Delay before the `retry_count`-th retry (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let interval = self.interval_ms as f64;
        let max_interval = self.max_interval_ms.max(self.interval_ms) as f64;

        let base = match self.backoff {
            Backoff::Fixed => interval,
            Backoff::Exponential { multiplier } => {
                let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
                interval * multiplier.powi(exponent)
            }
        };
        let base = if base.is_finite() {
            base.min(max_interval)
        } else {
            max_interval
        };

        let delay = if self.jitter > 0.0 && base > 0.0 {
            let range = base * self.jitter;
            let mut rng = rand::rng();
            (base + rng.random_range(-range..=range)).max(0.0)
        } else {
            base
        };

        Duration::from_micros((delay * 1000.0).round() as u64)
    }
}

/// Retries waiting for their due time, keyed by task id.
///
/// A task has at most one scheduled retry; scheduling again replaces it.
/// The lock is never held across an await.
#[derive(Debug, Default)]
pub struct RetryQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Debug, Default)]
struct QueueInner {
    by_due: BTreeSet<(Instant, TaskId)>,
    by_id: HashMap<TaskId, Instant>,
}

impl QueueInner {
    fn remove(&mut self, id: &TaskId, due: Instant) {
        if self.by_id.get(id) == Some(&due) {
            self.by_id.remove(id);
            self.by_due.remove(&(due, id.clone()));
        }
    }
}

/// Removes its entry when dropped, whether the wait finished or its future
/// was abandoned.
struct DueEntry<'a> {
    queue: &'a RetryQueue,
    id: &'a TaskId,
    due: Instant,
}

impl Drop for DueEntry<'_> {
    fn drop(&mut self) {
        self.queue.lock().remove(self.id, self.due);
    }
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(&self, id: TaskId, delay: Duration) -> Instant {
        let due = Instant::now() + delay;
        let mut inner = self.lock();
        if let Some(previous) = inner.by_id.insert(id.clone(), due) {
            inner.by_due.remove(&(previous, id.clone()));
        }
        inner.by_due.insert((due, id));
        due
    }

    /// Sleeps until the retry for `id` is due, then removes it. Returns `false`
    /// if nothing was scheduled for `id`.
    pub async fn wait(&self, id: &TaskId) -> bool {
        let due = self.lock().by_id.get(id).copied();
        let Some(due) = due else {
            return false;
        };

        let _entry = DueEntry {
            queue: self,
            id,
            due,
        };
        sleep_until(due).await;
        true
    }

    /// Scheduled retries, earliest first.
    pub fn scheduled(&self) -> Vec<(TaskId, Instant)> {
        self.lock()
            .by_due
            .iter()
            .map(|(due, id)| (id.clone(), *due))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
