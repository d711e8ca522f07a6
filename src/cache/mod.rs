//! Keyed single-flight cache with time-based expiry (spec §4.1).
//!
//! Concurrent misses on the same key compute once; misses on different
//! keys never block each other. The per-entry `tokio::sync::Mutex` is the
//! single-flight mechanism: the `DashMap` only ever hands out a clone of
//! the `Arc<Mutex<...>>`, so two callers racing on the same key both end
//! up awaiting the same lock.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::metrics::{CACHE_HITS, CACHE_MISSES};

struct Slot<V, E> {
    stored: Option<(Instant, Result<V, E>)>,
}

/// A TTL'd, single-flight cache keyed by `String`.
///
/// `V` and `E` must be `Clone` because concurrent callers share the same
/// stored result.
pub struct TtlCache<V, E> {
    ttl: Duration,
    entries: DashMap<String, Arc<Mutex<Slot<V, E>>>>,
}

impl<V, E> TtlCache<V, E>
where
    V: Clone,
    E: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Returns the cached value for `key` if it is still fresh; otherwise
    /// invokes `compute` exactly once among all concurrent callers for this
    /// key, stores the result (success or error) with a fresh timestamp,
    /// and returns it.
    pub async fn get<F, Fut>(&self, key: &str, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Slot { stored: None })))
            .clone();

        let mut guard = slot.lock().await;

        if let Some((stored_at, result)) = &guard.stored {
            if stored_at.elapsed() < self.ttl {
                CACHE_HITS.inc();
                return result.clone();
            }
        }

        CACHE_MISSES.inc();
        let result = compute().await;
        guard.stored = Some((Instant::now(), result.clone()));
        result
    }
}
