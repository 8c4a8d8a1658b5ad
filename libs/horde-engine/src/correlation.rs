use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use horde_api::StepName;

/// Secondary values of one join, by source step.
pub type CorrelatedValues<R> = HashMap<StepName, R>;

/// Partial state of the join for one key.
struct CorrelationEntry<R> {
    id: u64,
    values: CorrelatedValues<R>,
    /// Primary executions suspended until the values are complete.
    waiters: Vec<oneshot::Sender<CorrelatedValues<R>>>,
    written_at: Instant,
}

impl<R: Clone> CorrelationEntry<R> {
    fn new(id: u64) -> Self {
        Self {
            id,
            values: CorrelatedValues::new(),
            waiters: Vec::new(),
            written_at: Instant::now(),
        }
    }

    fn is_complete(&self, sources: usize) -> bool {
        self.values.len() >= sources
    }

    fn has_waiters(&self) -> bool {
        self.waiters.iter().any(|waiter| !waiter.is_closed())
    }

    fn release(self) {
        let Self {
            values,
            mut waiters,
            ..
        } = self;
        let Some(last) = waiters.pop() else {
            return;
        };
        for waiter in waiters {
            let _ = waiter.send(values.clone());
        }
        let _ = last.send(values);
    }
}

/// Waiter registration of a primary; discards the entry when dropped
/// before the values arrived.
struct Waiting<'a, K, R>
where
    K: Eq + Hash + Clone,
    R: Clone,
{
    cache: &'a CorrelationCache<K, R>,
    key: &'a K,
    entry_id: u64,
    rx: Option<oneshot::Receiver<CorrelatedValues<R>>>,
}

impl<K, R> Drop for Waiting<'_, K, R>
where
    K: Eq + Hash + Clone,
    R: Clone,
{
    fn drop(&mut self) {
        // The receiver goes first so `discard` sees this waiter as closed.
        if let Some(rx) = self.rx.take() {
            drop(rx);
            self.cache.discard(self.key, self.entry_id);
        }
    }
}

/// Result of a primary lookup.
pub enum Lookup<R> {
    /// Every source already delivered; the entry has been removed.
    Ready(CorrelatedValues<R>),
    /// Registered as waiter of the entry.
    Pending(Pending<R>),
}

pub struct Pending<R> {
    entry_id: u64,
    rx: oneshot::Receiver<CorrelatedValues<R>>,
}

#[derive(Debug)]
pub enum Completion<R> {
    Complete(CorrelatedValues<R>),
    TimedOut(Duration),
    Cancelled,
    /// The entry was dropped before completing.
    Evicted,
}

/// Concurrent store of partially joined values, by correlation key.
///
/// Each insertion and its completion check run as one operation under the
/// lock of the key's shard, so concurrent arrivals for a key can neither be
/// lost nor complete the join twice, while other keys are not held up.
pub struct CorrelationCache<K, R> {
    entries: DashMap<K, CorrelationEntry<R>>,
    sources: usize,
    timeout: Option<Duration>,
    sequence: AtomicU64,
}

impl<K, R> std::fmt::Debug for CorrelationCache<K, R>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationCache")
            .field("entries", &self.entries.len())
            .field("sources", &self.sources)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<K, R> CorrelationCache<K, R>
where
    K: Eq + Hash + Clone,
    R: Clone,
{
    /// - `sources`: number of secondary sources completing a join
    /// - `timeout`: lifetime of entries without writes; zero for unlimited
    pub fn new(sources: usize, timeout: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            sources,
            timeout: timeout.filter(|t| !t.is_zero()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Store the value of a secondary source. A previous value of the same
    /// source is replaced. Returns `true` when this completed a join.
    pub fn offer(&self, key: K, source: &str, value: R) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.values.insert(source.to_owned(), value);
                entry.written_at = Instant::now();
                if entry.is_complete(self.sources) && entry.has_waiters() {
                    occupied.remove().release();
                    return true;
                }
                false
            }
            Entry::Vacant(vacant) => {
                let mut entry = CorrelationEntry::new(self.next_id());
                entry.values.insert(source.to_owned(), value);
                vacant.insert(entry);
                false
            }
        }
    }

    /// Take the values of `key` when complete, otherwise register a waiter.
    pub fn lookup(&self, key: K) -> Lookup<R> {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_complete(self.sources) {
                    return Lookup::Ready(occupied.remove().values);
                }
                let (tx, rx) = oneshot::channel();
                let entry = occupied.get_mut();
                entry.waiters.push(tx);
                Lookup::Pending(Pending {
                    entry_id: entry.id,
                    rx,
                })
            }
            Entry::Vacant(vacant) => {
                if self.sources == 0 {
                    return Lookup::Ready(CorrelatedValues::new());
                }
                let (tx, rx) = oneshot::channel();
                let mut entry = CorrelationEntry::new(self.next_id());
                entry.waiters.push(tx);
                let entry_id = entry.id;
                vacant.insert(entry);
                Lookup::Pending(Pending { entry_id, rx })
            }
        }
    }

    /// Wait for the entry of `key` to complete, at most for the cache timeout.
    ///
    /// An entry that does not complete is discarded with whatever it collected,
    /// including when the returned future is dropped before completion.
    pub async fn wait(&self, key: &K, pending: Pending<R>, cancel: &CancellationToken) -> Completion<R> {
        let Pending { entry_id, rx } = pending;
        let mut waiting = Waiting {
            cache: self,
            key,
            entry_id,
            rx: Some(rx),
        };
        let Some(rx) = waiting.rx.as_mut() else {
            return Completion::Evicted;
        };
        let completion = match self.timeout {
            Some(timeout) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Completion::Cancelled,
                received = tokio::time::timeout(timeout, rx) => match received {
                    Ok(Ok(values)) => Completion::Complete(values),
                    Ok(Err(_)) => Completion::Evicted,
                    Err(_) => Completion::TimedOut(timeout),
                },
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => Completion::Cancelled,
                received = rx => match received {
                    Ok(values) => Completion::Complete(values),
                    Err(_) => Completion::Evicted,
                },
            },
        };
        if matches!(completion, Completion::Complete(_)) {
            waiting.rx = None;
        }
        completion
    }

    /// Drop the entry `entry_id` of `key` unless another primary still waits on it.
    fn discard(&self, key: &K, entry_id: u64) {
        if let Entry::Occupied(mut occupied) = self.entries.entry(key.clone()) {
            if occupied.get().id != entry_id {
                return;
            }
            occupied.get_mut().waiters.retain(|waiter| !waiter.is_closed());
            if occupied.get().waiters.is_empty() {
                occupied.remove();
            }
        }
    }

    /// Evict the entries nobody waits for that were not written within the
    /// timeout. Returns the number of evicted entries.
    pub fn evict_expired(&self) -> usize {
        let Some(timeout) = self.timeout else {
            return 0;
        };
        let mut evicted = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.has_waiters() || entry.written_at.elapsed() < timeout;
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn pending<R>(lookup: Lookup<R>) -> Pending<R> {
        match lookup {
            Lookup::Pending(pending) => pending,
            Lookup::Ready(_) => panic!("lookup should be pending"),
        }
    }

    #[tokio::test]
    async fn ready_when_every_source_arrived_first() {
        let cache = CorrelationCache::<u32, &str>::new(2, None);
        assert!(!cache.offer(123, "r2", "two"));
        assert!(!cache.offer(123, "r1", "one"));

        let Lookup::Ready(values) = cache.lookup(123) else {
            panic!("lookup should be ready");
        };

        assert_eq!(values.get("r1"), Some(&"one"));
        assert_eq!(values.get("r2"), Some(&"two"));
        assert!(!cache.contains_key(&123));
    }

    #[tokio::test]
    async fn waiter_is_released_by_last_source() {
        let cache = Arc::new(CorrelationCache::<u32, &str>::new(2, None));
        let waiting = pending(cache.lookup(123));
        assert!(!cache.offer(123, "r1", "one"));
        assert!(cache.offer(123, "r2", "two"));

        let Completion::Complete(values) = cache.wait(&123, waiting, &CancellationToken::new()).await else {
            panic!("join should complete");
        };

        assert_eq!(values.len(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn duplicate_values_keep_the_last_one() {
        let cache = CorrelationCache::<u32, u32>::new(2, None);
        cache.offer(1, "r1", 10);
        cache.offer(1, "r1", 11);
        assert!(cache.contains_key(&1));
        cache.offer(1, "r2", 20);

        let Lookup::Ready(values) = cache.lookup(1) else {
            panic!("lookup should be ready");
        };
        assert_eq!(values.get("r1"), Some(&11));
        assert_eq!(values.get("r2"), Some(&20));
    }

    #[tokio::test]
    async fn every_primary_on_a_key_gets_the_values() {
        let cache = CorrelationCache::<u32, u32>::new(1, None);
        let first = pending(cache.lookup(7));
        let second = pending(cache.lookup(7));
        cache.offer(7, "r1", 70);

        let token = CancellationToken::new();
        for waiting in [first, second] {
            let Completion::Complete(values) = cache.wait(&7, waiting, &token).await else {
                panic!("join should complete");
            };
            assert_eq!(values.get("r1"), Some(&70));
        }
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_entry_is_discarded_with_partial_values() {
        let cache = CorrelationCache::<u32, u32>::new(2, Some(Duration::from_millis(100)));
        let waiting = pending(cache.lookup(5));
        cache.offer(5, "r1", 1);

        let completion = cache.wait(&5, waiting, &CancellationToken::new()).await;

        assert!(matches!(completion, Completion::TimedOut(timeout) if timeout == Duration::from_millis(100)));
        assert!(!cache.contains_key(&5));

        // Nothing is retried: a late value starts a new entry from scratch.
        cache.offer(5, "r2", 2);
        assert!(matches!(cache.lookup(5), Lookup::Pending(_)));
    }

    #[tokio::test]
    async fn cancelled_wait_discards_entry() {
        let cache = CorrelationCache::<u32, u32>::new(1, None);
        let waiting = pending(cache.lookup(5));
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(cache.wait(&5, waiting, &token).await, Completion::Cancelled));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_wait_discards_entry() {
        let cache = CorrelationCache::<u32, u32>::new(2, None);
        let waiting = pending(cache.lookup(5));
        cache.offer(5, "r1", 1);

        let token = CancellationToken::new();
        let outcome = tokio::time::timeout(Duration::from_millis(10), cache.wait(&5, waiting, &token)).await;

        assert!(outcome.is_err());
        assert!(!cache.contains_key(&5));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_wait_keeps_entry_of_other_waiters() {
        let cache = CorrelationCache::<u32, u32>::new(1, None);
        let first = pending(cache.lookup(5));
        let second = pending(cache.lookup(5));

        let token = CancellationToken::new();
        let outcome = tokio::time::timeout(Duration::from_millis(10), cache.wait(&5, first, &token)).await;
        assert!(outcome.is_err());
        assert!(cache.contains_key(&5));

        assert!(cache.offer(5, "r1", 50));
        let Completion::Complete(values) = cache.wait(&5, second, &token).await else {
            panic!("join should complete");
        };
        assert_eq!(values.get("r1"), Some(&50));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unawaited_entries_expire() {
        let cache = CorrelationCache::<u32, u32>::new(2, Some(Duration::from_millis(100)));
        cache.offer(1, "r1", 1);
        let _waiting = pending(cache.lookup(2));

        tokio::time::advance(Duration::from_millis(50)).await;
        cache.offer(3, "r1", 3);
        tokio::time::advance(Duration::from_millis(60)).await;

        assert_eq!(cache.evict_expired(), 1);
        assert!(!cache.contains_key(&1));
        assert!(cache.contains_key(&2));
        assert!(cache.contains_key(&3));
    }

    #[tokio::test]
    async fn zero_sources_join_immediately() {
        let cache = CorrelationCache::<u32, u32>::new(0, Some(Duration::ZERO));
        assert_eq!(cache.timeout(), None);
        assert!(matches!(cache.lookup(1), Lookup::Ready(values) if values.is_empty()));
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_sources_complete_each_key_once() {
        let cache = Arc::new(CorrelationCache::<u32, u32>::new(2, None));
        let token = CancellationToken::new();
        let waiters: Vec<_> = (0..100u32)
            .map(|key| {
                let cache = Arc::clone(&cache);
                let token = token.clone();
                let waiting = pending(cache.lookup(key));
                tokio::spawn(async move { cache.wait(&key, waiting, &token).await })
            })
            .collect();

        let offers: Vec<_> = (0..100u32)
            .flat_map(|key| [("r1", key), ("r2", key + 1000)].map(|(source, value)| (key, source, value)))
            .map(|(key, source, value)| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.offer(key, source, value) })
            })
            .collect();

        let mut completed = 0;
        for offer in offers {
            if offer.await.unwrap() {
                completed += 1;
            }
        }
        for (key, waiter) in waiters.into_iter().enumerate() {
            let key = key as u32;
            match waiter.await.unwrap() {
                Completion::Complete(values) => {
                    assert_eq!(values.get("r1"), Some(&key));
                    assert_eq!(values.get("r2"), Some(&(key + 1000)));
                }
                other => panic!("unexpected completion for {key}: {other:?}"),
            }
        }
        assert_eq!(completed, 100);
        assert!(cache.is_empty());
    }
}
