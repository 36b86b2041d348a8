//! Keyed, request-deduplicating cache of server resources.
//!
//! Each key holds the last value fetched for it, the last error, and a
//! freshness flag. Reads never block: they return the current snapshot and
//! start a background fetch when the entry is stale. At most one fetch per key
//! is joinable at a time, and every fetch carries a per-key sequence number so
//! a slow response can never overwrite the result of a newer request.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ApiError;

pub type FetchResult<V> = Result<V, ApiError>;

/// Produces a fresh value for one key. Called again on every refetch.
pub type Fetcher<V> = Arc<dyn Fn() -> BoxFuture<'static, FetchResult<V>> + Send + Sync>;

type InFlight<V> = Shared<BoxFuture<'static, FetchResult<V>>>;

const CHANGE_CAPACITY: usize = 256;

/// Freshness of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Fetching,
}

/// Snapshot of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<V> {
    pub data: Option<V>,
    pub freshness: Freshness,
    pub error: Option<ApiError>,
}

impl<V> QueryState<V> {
    fn empty() -> Self {
        Self {
            data: None,
            freshness: Freshness::Stale,
            error: None,
        }
    }

    /// Nothing to show yet and a request is on its way.
    pub fn is_loading(&self) -> bool {
        self.data.is_none() && self.freshness == Freshness::Fetching
    }

    pub fn is_fetching(&self) -> bool {
        self.freshness == Freshness::Fetching
    }

    pub fn is_stale(&self) -> bool {
        self.freshness != Freshness::Fresh
    }

    /// Convert the payload, keeping freshness and error.
    pub fn map<U>(self, f: impl FnOnce(V) -> Option<U>) -> QueryState<U> {
        QueryState {
            data: self.data.and_then(f),
            freshness: self.freshness,
            error: self.error,
        }
    }
}

struct Entry<V> {
    data: Option<V>,
    error: Option<ApiError>,
    stale: bool,
    /// Sequence number of the most recently issued fetch.
    issued: u64,
    /// Bumped on every invalidation.
    generation: u64,
    in_flight: Option<(u64, InFlight<V>)>,
    fetcher: Option<Fetcher<V>>,
    observers: usize,
}

impl<V: Clone> Entry<V> {
    fn new() -> Self {
        Self {
            data: None,
            error: None,
            stale: true,
            issued: 0,
            generation: 0,
            in_flight: None,
            fetcher: None,
            observers: 0,
        }
    }

    fn freshness(&self) -> Freshness {
        if self.in_flight.is_some() {
            Freshness::Fetching
        } else if self.stale {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    fn needs_fetch(&self) -> bool {
        self.in_flight.is_none() && (self.stale || self.data.is_none())
    }

    fn snapshot(&self) -> QueryState<V> {
        QueryState {
            data: self.data.clone(),
            freshness: self.freshness(),
            error: self.error.clone(),
        }
    }
}

struct Inner<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    changes: broadcast::Sender<K>,
}

impl<K, V> Inner<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, key: &K) {
        // No receivers just means nobody is watching right now.
        let _ = self.changes.send(key.clone());
    }

    /// Apply a finished fetch if it is still the latest one for its key.
    fn settle(&self, key: &K, seq: u64, generation: u64, result: &FetchResult<V>) {
        {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            if matches!(entry.in_flight, Some((current, _)) if current == seq) {
                entry.in_flight = None;
            }
            if seq != entry.issued {
                debug!(?key, seq, latest = entry.issued, "discarding superseded response");
                return;
            }
            match result {
                Ok(value) => {
                    entry.data = Some(value.clone());
                    entry.error = None;
                    // Invalidated while the request was out: the answer may
                    // predate the change, so the next read fetches again.
                    entry.stale = entry.generation != generation;
                    debug!(?key, seq, stale = entry.stale, "fetch applied");
                }
                Err(err) => {
                    warn!(?key, seq, error = %err, "fetch failed, keeping previous data");
                    entry.error = Some(err.clone());
                    entry.stale = true;
                }
            }
        }
        self.notify(key);
    }
}

/// The cache itself. Cheap to clone; clones share state.
pub struct QueryCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for QueryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for QueryCache<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> QueryCache<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                changes,
            }),
        }
    }

    /// Current snapshot for `key` without side effects.
    pub fn state(&self, key: &K) -> QueryState<V> {
        self.inner
            .lock()
            .get(key)
            .map(Entry::snapshot)
            .unwrap_or_else(QueryState::empty)
    }

    /// Return the current snapshot and start a fetch when the entry is stale
    /// and nothing is in flight. Must be called inside a tokio runtime.
    pub fn read(&self, key: &K, fetcher: Fetcher<V>) -> QueryState<V> {
        let (snapshot, started) = {
            let mut entries = self.inner.lock();
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            entry.fetcher = Some(Arc::clone(&fetcher));
            let started = entry.needs_fetch();
            if started {
                let _ = self.start_fetch(key, entry, fetcher);
            }
            (entry.snapshot(), started)
        };
        if started {
            self.inner.notify(key);
        }
        snapshot
    }

    /// Resolve a value for `key`: fresh data is returned directly, an in-flight
    /// fetch is joined, otherwise a new fetch starts.
    pub async fn fetch(&self, key: &K, fetcher: Fetcher<V>) -> FetchResult<V> {
        let pending = {
            let mut entries = self.inner.lock();
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            entry.fetcher = Some(Arc::clone(&fetcher));
            match (&entry.in_flight, &entry.data) {
                (Some((_, in_flight)), _) => in_flight.clone(),
                (None, Some(data)) if !entry.stale => return Ok(data.clone()),
                _ => self.start_fetch(key, entry, fetcher),
            }
        };
        pending.await
    }

    /// Mark `key` stale. When the key has observers its last fetcher runs
    /// again right away, superseding any fetch already in flight.
    ///
    /// Returns true if a refetch was started.
    pub fn invalidate(&self, key: &K) -> bool {
        let refetched = {
            let mut entries = self.inner.lock();
            let Some(entry) = entries.get_mut(key) else {
                return false;
            };
            entry.stale = true;
            entry.generation += 1;
            match (&entry.fetcher, entry.observers) {
                (Some(fetcher), observers) if observers > 0 => {
                    let fetcher = Arc::clone(fetcher);
                    let _ = self.start_fetch(key, entry, fetcher);
                    true
                }
                _ => false,
            }
        };
        debug!(?key, refetched, "invalidated");
        self.inner.notify(key);
        refetched
    }

    /// Invalidate every known key matching `predicate`. Returns how many keys
    /// were invalidated.
    pub fn invalidate_matching(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let keys: Vec<K> = self
            .inner
            .lock()
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        for key in &keys {
            self.invalidate(key);
        }
        keys.len()
    }

    /// Store a value directly, as if a fetch had just returned it. Any fetch
    /// still in flight for the key is superseded.
    pub fn set_data(&self, key: &K, value: V) {
        {
            let mut entries = self.inner.lock();
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            entry.issued += 1;
            entry.in_flight = None;
            entry.data = Some(value);
            entry.error = None;
            entry.stale = false;
        }
        self.inner.notify(key);
    }

    /// Drop an entry entirely.
    pub fn remove(&self, key: &K) {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            self.inner.notify(key);
        }
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Register interest in `key`. While at least one observer is alive,
    /// invalidating the key refetches it immediately.
    pub fn observe(&self, key: K, fetcher: Fetcher<V>) -> QueryObserver<K, V> {
        let changes = self.inner.changes.subscribe();
        self.inner
            .lock()
            .entry(key.clone())
            .or_insert_with(Entry::new)
            .observers += 1;
        self.read(&key, fetcher);
        QueryObserver {
            cache: self.clone(),
            key,
            changes,
        }
    }

    /// Subscribe to change notifications for all keys.
    pub fn changes(&self) -> broadcast::Receiver<K> {
        self.inner.changes.subscribe()
    }

    fn start_fetch(&self, key: &K, entry: &mut Entry<V>, fetcher: Fetcher<V>) -> InFlight<V> {
        entry.issued += 1;
        let seq = entry.issued;
        let generation = entry.generation;
        let inner: Weak<Inner<K, V>> = Arc::downgrade(&self.inner);
        let fetch_key = key.clone();

        let fut = async move {
            let result = fetcher().await;
            if let Some(inner) = inner.upgrade() {
                inner.settle(&fetch_key, seq, generation, &result);
            }
            result
        }
        .boxed()
        .shared();

        entry.in_flight = Some((seq, fut.clone()));
        // Drive the fetch even if no caller awaits it.
        tokio::spawn(fut.clone());
        debug!(?key, seq, "fetch started");
        fut
    }

    fn release(&self, key: &K) {
        if let Some(entry) = self.inner.lock().get_mut(key) {
            entry.observers = entry.observers.saturating_sub(1);
        }
    }
}

/// Live interest in one key. Dropping it unregisters the observer.
pub struct QueryObserver<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: QueryCache<K, V>,
    key: K,
    changes: broadcast::Receiver<K>,
}

impl<K, V> QueryObserver<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn state(&self) -> QueryState<V> {
        self.cache.state(&self.key)
    }

    /// Wait for the next change to this key and return the new snapshot.
    pub async fn changed(&mut self) -> QueryState<V> {
        loop {
            match self.changes.recv().await {
                Ok(key) if key == self.key => return self.state(),
                Ok(_) => continue,
                // Missed notifications: the current snapshot is all that matters.
                Err(broadcast::error::RecvError::Lagged(_)) => return self.state(),
                Err(broadcast::error::RecvError::Closed) => return self.state(),
            }
        }
    }
}

impl<K, V> Drop for QueryObserver<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}
