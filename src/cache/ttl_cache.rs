use dashmap::DashMap;
use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

/// Cache entry con expiración
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_removals: AtomicU64,
}

/// Concurrent cache whose entries expire after a fixed TTL.
///
/// When full, inserting evicts the oldest entry. Clones share storage.
#[derive(Debug)]
pub struct TtlCache<K: Clone + Eq + Hash, V> {
    data: Arc<DashMap<K, CacheEntry<V>>>,
    counters: Arc<Counters>,
    ttl: Duration,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        if self.data.len() >= self.capacity && !self.data.contains_key(&key) {
            self.evict_oldest();
        }

        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
        };
        self.data.insert(key, entry).map(|old| old.value)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.data.get(key) {
            Some(entry) if !entry.is_expired(self.ttl) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired && self.data.remove(key).is_some() {
            self.counters.expired_removals.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Limpia entradas expiradas y retorna el número de elementos removidos
    pub fn cleanup_expired(&self) -> usize {
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(self.ttl));
        let removed = before.saturating_sub(self.data.len());

        if removed > 0 {
            self.counters
                .expired_removals
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Limpiadas {} entradas expiradas del cache", removed);
        }

        removed
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired_removals: self.counters.expired_removals.load(Ordering::Relaxed),
        }
    }

    fn evict_oldest(&self) {
        let oldest = self
            .data
            .iter()
            .min_by_key(|entry| entry.value().created_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.data.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<K, V> Clone for TtlCache<K, V>
where
    K: Clone + Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            counters: self.counters.clone(),
            ttl: self.ttl,
            capacity: self.capacity,
        }
    }
}

/// Métricas básicas del cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_removals: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}
