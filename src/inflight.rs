//! Request coalescing.
//!
//! Keeps track of the operations currently running per key so that concurrent
//! callers for the same key share one outcome instead of starting their own.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome observed by every caller of the same key.
///
/// Resolves to `None` when the operation produced nothing for the key: it
/// panicked, or a batch operation left the key out of its result.
pub type Pending<V> = Shared<BoxFuture<'static, Option<V>>>;

/// Registry of in-flight operations, at most one per key.
///
/// Operations are spawned onto the runtime, so they run to completion even
/// when every caller stops waiting. The record of a key is removed as soon as
/// its operation settles, whatever the outcome, so the next call starts over.
pub struct InFlight<K, V> {
    pending: Arc<DashMap<K, Pending<V>>>,
}

impl<K, V> Clone for InFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

enum Claim<V> {
    Joined(Pending<V>),
    Owned(Pending<V>, oneshot::Sender<V>),
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Joins the operation running for `key`, or registers and spawns
    /// `operation` if there is none.
    ///
    /// Registration happens before this returns, so it is not `async`: a
    /// second call for the same key always sees the first one.
    pub fn begin<F>(&self, key: K, operation: F) -> Pending<V>
    where
        F: Future<Output = V> + Send + 'static,
    {
        match self.claim(key.clone()) {
            Claim::Joined(pending) => {
                debug!(key = ?key, "joined in-flight operation");
                pending
            }
            Claim::Owned(pending, sender) => {
                let removal = self.removal_guard(vec![key]);
                tokio::spawn(async move {
                    let value = operation.await;
                    // Evict before publishing: a caller either joins a channel
                    // that will receive the value, or starts a new one.
                    drop(removal);
                    sender.send(value).ok();
                });
                pending
            }
        }
    }

    /// Like [`begin`](Self::begin) for a group of keys resolved by one call.
    ///
    /// Keys already in flight are joined; the remaining ones are registered
    /// and handed to `operation` in a single spawned call. Duplicate keys are
    /// ignored. Keys missing from the operation's result settle as `None`.
    pub fn begin_batch<I, F, Fut>(&self, keys: I, operation: F) -> Vec<(K, Pending<V>)>
    where
        I: IntoIterator<Item = K>,
        F: FnOnce(Vec<K>) -> Fut + Send + 'static,
        Fut: Future<Output = HashMap<K, V>> + Send + 'static,
    {
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let mut owned = Vec::new();

        for key in keys {
            if !seen.insert(key.clone()) {
                continue;
            }
            match self.claim(key.clone()) {
                Claim::Joined(shared) => {
                    debug!(key = ?key, "joined in-flight operation");
                    pending.push((key, shared));
                }
                Claim::Owned(shared, sender) => {
                    owned.push((key.clone(), sender));
                    pending.push((key, shared));
                }
            }
        }

        if owned.is_empty() {
            return pending;
        }

        let keys: Vec<K> = owned.iter().map(|(key, _)| key.clone()).collect();
        let removal = self.removal_guard(keys.clone());
        tokio::spawn(async move {
            let mut values = operation(keys).await;
            drop(removal);
            for (key, sender) in owned {
                if let Some(value) = values.remove(&key) {
                    sender.send(value).ok();
                }
            }
        });

        pending
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Check and register under the entry lock, with no await in between.
    fn claim(&self, key: K) -> Claim<V> {
        match self.pending.entry(key) {
            Entry::Occupied(entry) => Claim::Joined(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (sender, receiver) = oneshot::channel();
                let shared = receiver.map(Result::ok).boxed().shared();
                entry.insert(shared.clone());
                Claim::Owned(shared, sender)
            }
        }
    }

    fn removal_guard(&self, keys: Vec<K>) -> CallOnDrop {
        let pending = Arc::clone(&self.pending);
        CallOnDrop::new(move || {
            for key in &keys {
                pending.remove(key);
            }
        })
    }
}

impl<K, V> Default for InFlight<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a closure when dropped, including during a panic unwind.
struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    fn new<F: FnOnce() + Send + 'static>(f: F) -> Self {
        Self {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(
        calls: &Arc<AtomicUsize>,
        gate: oneshot::Receiver<()>,
        value: &'static str,
    ) -> impl Future<Output = String> + Send + 'static {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            gate.await.ok();
            value.to_string()
        }
    }

    async fn explode() -> String {
        panic!("upstream exploded")
    }

    async fn never_called(_keys: Vec<u64>) -> HashMap<u64, String> {
        panic!("batch operation must not run")
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_operation() {
        let in_flight: InFlight<u64, String> = InFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel();

        let mut waiters = vec![in_flight.begin(42, counted(&calls, gate, "signed-42"))];
        for _ in 0..4 {
            let (_unused, gate) = oneshot::channel();
            waiters.push(in_flight.begin(42, counted(&calls, gate, "other")));
        }
        assert!(in_flight.contains(&42));
        assert_eq!(in_flight.len(), 1);

        release.send(()).unwrap();
        let results = join_all(waiters).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_deref() == Some("signed-42")));
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_record_removed_after_settling() {
        let in_flight: InFlight<u64, String> = InFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (release, gate) = oneshot::channel();
        let first = in_flight.begin(7, counted(&calls, gate, "a"));
        release.send(()).unwrap();
        assert_eq!(first.await.as_deref(), Some("a"));
        assert!(!in_flight.contains(&7));

        let (release, gate) = oneshot::channel();
        let second = in_flight.begin(7, counted(&calls, gate, "b"));
        release.send(()).unwrap();
        assert_eq!(second.await.as_deref(), Some("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_operation_releases_key() {
        let in_flight: InFlight<u64, String> = InFlight::new();

        let pending = in_flight.begin(5, explode());
        let joined = in_flight.begin(5, async { "never".to_string() });

        assert_eq!(pending.await, None);
        assert_eq!(joined.await, None);
        assert!(!in_flight.contains(&5));

        let retry = in_flight.begin(5, async { "ok".to_string() });
        assert_eq!(retry.await.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_batch_joins_running_keys_and_claims_the_rest() {
        let in_flight: InFlight<u64, String> = InFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel();
        let single = in_flight.begin(1, counted(&calls, gate, "one"));

        let batch_keys = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_keys = Arc::clone(&batch_keys);
        let pending = in_flight.begin_batch(vec![1, 2, 3, 2], move |keys| async move {
            seen_keys.lock().unwrap().extend(keys);
            // 3 is left out on purpose
            HashMap::from([(2, "two".to_string())])
        });

        let keys: Vec<u64> = pending.iter().map(|(key, _)| *key).collect();
        assert_eq!(keys, vec![1, 2, 3]);

        release.send(()).unwrap();
        let results: Vec<Option<String>> =
            join_all(pending.into_iter().map(|(_, shared)| shared)).await;

        assert_eq!(*batch_keys.lock().unwrap(), vec![2, 3]);
        assert_eq!(
            results,
            vec![Some("one".to_string()), Some("two".to_string()), None]
        );
        assert_eq!(single.await.as_deref(), Some("one"));
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_batch_with_everything_in_flight_spawns_nothing() {
        let in_flight: InFlight<u64, String> = InFlight::new();
        let (release, gate) = oneshot::channel::<()>();
        let _single = in_flight.begin(1, async move {
            gate.await.ok();
            "one".to_string()
        });

        let pending = in_flight.begin_batch(vec![1], never_called);
        release.send(()).unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.clone().await.as_deref(), Some("one"));
    }
}
