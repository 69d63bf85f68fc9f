//! Lazy-refresh caches.
//!
//! A read serves the cached value while it is ready and otherwise runs the
//! caller's retrieve future. Refreshes are funnelled: concurrent readers of
//! a slot being refreshed wait for that refresh and observe its value
//! instead of starting their own. Invalidation marks a value stale without
//! evicting it.

pub mod fabric;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::FetchError;
use crate::export::health::HealthMetrics;

pub use self::fabric::{FabricCache, InvalidationReport};

#[derive(Clone)]
struct CacheMetrics {
    name: &'static str,
    health: Arc<HealthMetrics>,
}

impl CacheMetrics {
    fn hit(&self) {
        self.health.cache_hits.with_label_values(&[self.name]).inc();
    }

    fn miss(&self) {
        self.health.cache_misses.with_label_values(&[self.name]).inc();
    }

    fn refreshed(&self) {
        self.health
            .cache_refreshes
            .with_label_values(&[self.name])
            .inc();
    }

    fn invalidated(&self, n: usize) {
        self.health
            .cache_invalidations
            .with_label_values(&[self.name])
            .inc_by(n as f64);
    }
}

/// Single-slot lazy cache.
pub struct LazyCache<T> {
    name: &'static str,
    value: Mutex<Option<Arc<T>>>,
    ready: AtomicBool,
    epoch: AtomicU64,
    funnel: tokio::sync::Mutex<()>,
    metrics: Option<CacheMetrics>,
}

impl<T> fmt::Debug for LazyCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCache")
            .field("name", &self.name)
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + Sync> LazyCache<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Mutex::new(None),
            ready: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            funnel: tokio::sync::Mutex::new(()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(CacheMetrics {
            name: self.name,
            health: metrics,
        });
        self
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn ready_value(&self) -> Option<Arc<T>> {
        if !self.is_ready() {
            return None;
        }
        self.value.lock().clone()
    }

    /// Returns the cached value, refreshing it with `retrieve` if not ready.
    ///
    /// An empty result is cached like any other.
    pub async fn get<F, Fut>(&self, retrieve: F) -> Result<Arc<T>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        if let Some(v) = self.ready_value() {
            if let Some(m) = &self.metrics {
                m.hit();
            }
            return Ok(v);
        }

        let _funnel = self.funnel.lock().await;
        if let Some(v) = self.ready_value() {
            if let Some(m) = &self.metrics {
                m.hit();
            }
            return Ok(v);
        }
        if let Some(m) = &self.metrics {
            m.miss();
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let value = Arc::new(retrieve().await?);
        *self.value.lock() = Some(Arc::clone(&value));

        // An invalidation during the retrieve leaves the slot stale.
        if self.epoch.load(Ordering::Acquire) == epoch {
            self.ready.store(true, Ordering::Release);
        }
        if let Some(m) = &self.metrics {
            m.refreshed();
        }
        debug!(cache = self.name, "cache refreshed");

        Ok(value)
    }

    /// Last retrieved value, ready or not.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.value.lock().clone()
    }

    /// Forces the next read to refresh. The stale value is kept.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if self.ready.swap(false, Ordering::AcqRel) {
            if let Some(m) = &self.metrics {
                m.invalidated(1);
            }
        }
    }
}

struct Entry<V> {
    value: Arc<V>,
    ready: bool,
    stored_at: Instant,
    last_used: u64,
}

struct KeyedState<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Keys being refreshed, with whether they were invalidated meanwhile.
    inflight: HashMap<K, bool>,
    clock: u64,
}

/// Keyed lazy cache, bounded with LRU eviction and a time-to-live.
pub struct KeyedCache<K, V> {
    name: &'static str,
    capacity: usize,
    ttl: Duration,
    state: Mutex<KeyedState<K, V>>,
    funnels: DashMap<K, Arc<tokio::sync::Mutex<()>>>,
    metrics: Option<CacheMetrics>,
}

impl<K, V> fmt::Debug for KeyedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCache")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .field("len", &self.state.lock().entries.len())
            .finish()
    }
}

/// Clears the in-flight mark of a refresh that failed or was dropped.
struct Refreshing<'a, K: Eq + Hash, V> {
    state: &'a Mutex<KeyedState<K, V>>,
    key: &'a K,
}

impl<K: Eq + Hash, V> Drop for Refreshing<'_, K, V> {
    fn drop(&mut self) {
        self.state.lock().inflight.remove(self.key);
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Send + Sync,
{
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            ttl,
            state: Mutex::new(KeyedState {
                entries: HashMap::new(),
                inflight: HashMap::new(),
                clock: 0,
            }),
            funnels: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(CacheMetrics {
            name: self.name,
            health: metrics,
        });
        self
    }

    fn ready_value(&self, key: &K) -> Option<Arc<V>> {
        let mut st = self.state.lock();
        st.clock += 1;
        let tick = st.clock;
        let ttl = self.ttl;
        let entry = st.entries.get_mut(key)?;
        if !entry.ready || entry.stored_at.elapsed() >= ttl {
            return None;
        }
        entry.last_used = tick;
        Some(Arc::clone(&entry.value))
    }

    /// Returns the value for `key`, refreshing it with `retrieve` if it is
    /// missing, invalidated, or expired.
    ///
    /// A refreshed value is stored stale when `key` itself was invalidated
    /// while `retrieve` ran. Invalidating other keys does not affect it.
    pub async fn get<F, Fut>(&self, key: &K, retrieve: F) -> Result<Arc<V>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, FetchError>>,
    {
        if let Some(v) = self.ready_value(key) {
            if let Some(m) = &self.metrics {
                m.hit();
            }
            return Ok(v);
        }

        let funnel = self
            .funnels
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _funnel = funnel.lock().await;

        if let Some(v) = self.ready_value(key) {
            if let Some(m) = &self.metrics {
                m.hit();
            }
            return Ok(v);
        }
        if let Some(m) = &self.metrics {
            m.miss();
        }

        self.state.lock().inflight.insert(key.clone(), false);
        let _refreshing = Refreshing {
            state: &self.state,
            key,
        };
        let value = Arc::new(retrieve().await?);
        self.store(key.clone(), Arc::clone(&value));

        if let Some(m) = &self.metrics {
            m.refreshed();
        }
        debug!(cache = self.name, "cache entry refreshed");

        Ok(value)
    }

    fn store(&self, key: K, value: Arc<V>) {
        let mut st = self.state.lock();
        st.clock += 1;
        let tick = st.clock;
        let ready = !st.inflight.remove(&key).unwrap_or(false);

        if !st.entries.contains_key(&key) && st.entries.len() >= self.capacity {
            let lru = st
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(lru) = lru {
                st.entries.remove(&lru);
                // A funnel still held by a waiting reader stays shared.
                self.funnels
                    .remove_if(&lru, |_, funnel| Arc::strong_count(funnel) == 1);
            }
        }

        st.entries.insert(
            key,
            Entry {
                value,
                ready,
                stored_at: Instant::now(),
                last_used: tick,
            },
        );
    }

    /// Last retrieved value for `key`, ready or not.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|e| Arc::clone(&e.value))
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries that would be served without a refresh.
    pub fn ready_len(&self) -> usize {
        let ttl = self.ttl;
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.ready && e.stored_at.elapsed() < ttl)
            .count()
    }

    fn record_invalidated(&self, n: usize) {
        if n > 0 {
            if let Some(m) = &self.metrics {
                m.invalidated(n);
            }
        }
    }

    pub fn invalidate(&self, key: &K) -> bool {
        let hit = {
            let mut st = self.state.lock();
            if let Some(dirty) = st.inflight.get_mut(key) {
                *dirty = true;
            }
            match st.entries.get_mut(key) {
                Some(e) if e.ready => {
                    e.ready = false;
                    true
                }
                _ => false,
            }
        };
        self.record_invalidated(usize::from(hit));
        hit
    }

    /// Marks every entry matching `pred` stale. Returns how many were.
    ///
    /// A key being refreshed is judged by its previous value; one with no
    /// previous value is left alone.
    pub fn invalidate_if(&self, mut pred: impl FnMut(&K, &V) -> bool) -> usize {
        let n = {
            let mut st = self.state.lock();
            let KeyedState {
                entries, inflight, ..
            } = &mut *st;
            let mut n = 0;
            for (k, e) in entries.iter_mut() {
                if !pred(k, e.value.as_ref()) {
                    continue;
                }
                if let Some(dirty) = inflight.get_mut(k) {
                    *dirty = true;
                }
                if e.ready {
                    e.ready = false;
                    n += 1;
                }
            }
            n
        };
        self.record_invalidated(n);
        n
    }

    /// Marks everything stale, including keys whose first refresh is running.
    pub fn invalidate_all(&self) -> usize {
        let n = {
            let mut st = self.state.lock();
            st.inflight.values_mut().for_each(|dirty| *dirty = true);
            st.entries
                .values_mut()
                .filter(|e| e.ready)
                .map(|e| e.ready = false)
                .count()
        };
        self.record_invalidated(n);
        n
    }
}
