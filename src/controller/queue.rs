//! Rate-limited work queue (spec §4.5 "Retry policy"), translating the
//! client-go `workqueue.RateLimitingInterface` semantics the original
//! controller (`controller/controller.go`) relies on into tokio-native
//! primitives: dedup on enqueue, exponential backoff per key, a 5-attempt
//! cap before giving up.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::warn;

pub const MAX_RETRIES: u32 = 5;

struct Inner {
    queue: VecDeque<String>,
    queued: std::collections::HashSet<String>,
    delayed: HashMap<String, Instant>,
    retries: HashMap<String, u32>,
    shutting_down: bool,
}

/// A deduplicating, rate-limited queue of resource keys to reconcile.
///
/// At most one copy of any key is ever queued at once (enqueuing an
/// already-queued key is a no-op), matching the work-queue property that
/// a single resource-key is never reconciled concurrently with itself.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl WorkQueue {
    pub fn new(base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: std::collections::HashSet::new(),
                delayed: HashMap::new(),
                retries: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base_backoff,
            max_backoff,
        }
    }

    /// Enqueues `key` immediately unless it is already queued.
    pub fn add(&self, key: String) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down {
            return;
        }
        if inner.queued.insert(key.clone()) {
            inner.queue.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Re-enqueues `key` after an exponential backoff delay, bumping its
    /// retry count. Returns `false` (and forgets the key) once the retry
    /// count exceeds [`MAX_RETRIES`].
    pub fn add_rate_limited(&self, key: String) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let attempts = inner.retries.entry(key.clone()).or_insert(0);
        *attempts += 1;
        if *attempts > MAX_RETRIES {
            warn!(key = %key, attempts = *attempts, "dropping out of the queue after too many retries");
            inner.retries.remove(&key);
            return false;
        }

        let exponent = attempts.saturating_sub(1).min(16);
        let delay = self.base_backoff.saturating_mul(1u32 << exponent).min(self.max_backoff);
        inner.delayed.insert(key, Instant::now() + delay);
        true
    }

    /// Clears the backoff history for `key`. Called after a successful
    /// sync (client-go's `queue.Forget`).
    pub fn forget(&self, key: &str) {
        self.inner.lock().unwrap().retries.remove(key);
    }

    /// Blocks until a key is ready to process, promoting any delayed keys
    /// whose backoff has elapsed. Returns `None` once shut down with an
    /// empty queue.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                self.promote_delayed(&mut inner);

                if let Some(key) = inner.queue.pop_front() {
                    inner.queued.remove(&key);
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }

            let wait = {
                let inner = self.inner.lock().unwrap();
                inner.delayed.values().min().copied()
            };

            match wait {
                Some(ready_at) => {
                    let now = Instant::now();
                    if ready_at > now {
                        tokio::select! {
                            _ = tokio::time::sleep(ready_at - now) => {},
                            _ = self.notify.notified() => {},
                        }
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    fn promote_delayed(&self, inner: &mut Inner) {
        let now = Instant::now();
        let ready: Vec<String> = inner
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in ready {
            inner.delayed.remove(&key);
            if inner.queued.insert(key.clone()) {
                inner.queue.push_back(key);
            }
        }
    }

    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_dedups_identical_keys() {
        let q = WorkQueue::new(Duration::from_millis(1), Duration::from_secs(1));
        q.add("a".to_string());
        q.add("a".to_string());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn get_returns_queued_key() {
        let q = WorkQueue::new(Duration::from_millis(1), Duration::from_secs(1));
        q.add("a".to_string());
        assert_eq!(q.get().await, Some("a".to_string()));
    }

    #[tokio::test]
    async fn rate_limited_requeue_eventually_becomes_ready() {
        let q = WorkQueue::new(Duration::from_millis(5), Duration::from_secs(1));
        assert!(q.add_rate_limited("a".to_string()));
        let key = q.get().await;
        assert_eq!(key, Some("a".to_string()));
    }

    #[test]
    fn forgetting_resets_retry_count() {
        let q = WorkQueue::new(Duration::from_millis(1), Duration::from_secs(1));
        for _ in 0..MAX_RETRIES {
            assert!(q.add_rate_limited("a".to_string()));
        }
        q.forget("a");
        assert!(q.add_rate_limited("a".to_string()));
    }

    #[test]
    fn drops_key_after_max_retries() {
        let q = WorkQueue::new(Duration::from_millis(1), Duration::from_secs(1));
        for _ in 0..MAX_RETRIES {
            assert!(q.add_rate_limited("a".to_string()));
        }
        assert!(!q.add_rate_limited("a".to_string()));
    }

    #[tokio::test]
    async fn get_returns_none_after_shutdown_with_empty_queue() {
        let q = WorkQueue::new(Duration::from_millis(1), Duration::from_secs(1));
        q.shutdown();
        assert_eq!(q.get().await, None);
    }
}
