//! Coalescing of concurrent lookups for the same key.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Runs at most one computation per key at a time.
///
/// Callers that arrive while a computation for their key is running wait
/// for it and receive a clone of its result. The entry is dropped as soon as
/// the computation finishes, so the next caller starts a new one.
pub struct SingleFlight<K, V> {
    calls: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Run `compute` for `key`, or join the computation already running.
    ///
    /// If the leading caller is cancelled, one of the waiters takes over and
    /// runs its own `compute`.
    pub async fn run<F, Fut>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = self
            .calls
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let value = cell.get_or_init(compute).await.clone();

        // Only the entry we waited on; a newer one may already be running
        self.calls.remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
        value
    }

    /// Number of keys with a computation in progress.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
