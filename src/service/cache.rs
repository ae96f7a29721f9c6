//! LRU cache of loaded retriever services
//!
//! Services live in a slab with stable slot indices. The LRU maps keys to
//! slots and tracks recency. Both sit behind one mutex; the services
//! themselves are immutable and handed out as `Arc`s.
//!
//! Every knowledge base carries a generation that [`ServiceCache::invalidate_kb`]
//! bumps. A load records the generation of its key before it starts and
//! [`ServiceCache::insert_if_current`] refuses to cache the result once that
//! generation has moved on.

use crate::embedding::ProviderIdentity;
use crate::error::{Result, StratumError};
use crate::retrieval::RetrieverKindChoice;
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Identity of a cached service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Sorted and deduplicated
    kb_ids: Vec<String>,
    kind: RetrieverKindChoice,
    provider: String,
    params: String,
}

impl CacheKey {
    pub fn new(
        kb_ids: &[String],
        kind: RetrieverKindChoice,
        provider: &ProviderIdentity,
        params: &impl Serialize,
    ) -> Result<Self> {
        let mut kb_ids = kb_ids.to_vec();
        kb_ids.sort();
        kb_ids.dedup();

        let params = serde_json::to_vec(params).map_err(|e| StratumError::Json {
            source: e,
            context: "Failed to serialize service parameters".to_string(),
        })?;

        Ok(Self {
            kb_ids,
            kind,
            provider: provider.fingerprint(),
            params: blake3::hash(&params).to_hex().to_string(),
        })
    }

    pub fn kb_ids(&self) -> &[String] {
        &self.kb_ids
    }

    pub fn mentions(&self, kb_id: &str) -> bool {
        self.kb_ids.iter().any(|id| id == kb_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

struct Inner<T> {
    slots: Vec<Option<Arc<T>>>,
    free: Vec<usize>,
    recency: LruCache<CacheKey, usize>,
    stats: CacheStats,
    generations: HashMap<String, u64>,
    /// Bumped by `clear`
    epoch: u64,
    loading: HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
}

impl<T> Inner<T> {
    fn release(&mut self, slot: usize) {
        self.slots[slot] = None;
        self.free.push(slot);
    }
}

pub struct ServiceCache<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> ServiceCache<T> {
    /// A zero capacity is treated as one
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::with_capacity(capacity.get()),
                free: Vec::new(),
                recency: LruCache::new(capacity),
                stats: CacheStats {
                    capacity: capacity.get(),
                    ..CacheStats::default()
                },
                generations: HashMap::new(),
                epoch: 0,
                loading: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a service, marking it most recently used
    pub fn get(&self, key: &CacheKey) -> Option<Arc<T>> {
        let mut inner = self.lock();
        match inner.recency.get(key).copied() {
            Some(slot) => {
                inner.stats.hits += 1;
                inner.slots[slot].clone()
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Look up a service without touching recency or statistics
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<T>> {
        let inner = self.lock();
        let slot = inner.recency.peek(key).copied()?;
        inner.slots[slot].clone()
    }

    /// Current generation of `key`; changes whenever one of its knowledge
    /// bases is invalidated or the cache is cleared
    pub fn generation(&self, key: &CacheKey) -> u64 {
        let inner = self.lock();
        key.kb_ids
            .iter()
            .map(|id| inner.generations.get(id).copied().unwrap_or(0))
            .sum::<u64>()
            + inner.epoch
    }

    /// Lock held while loading the service for `key`
    ///
    /// Concurrent misses on one key wait on the same lock and find the first
    /// load's result in the cache. Locks nobody holds are pruned.
    pub fn load_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut inner = self.lock();
        inner.loading.retain(|_, lock| Arc::strong_count(lock) > 1);
        inner.loading.entry(key.clone()).or_default().clone()
    }

    /// Insert a service loaded at `generation`
    ///
    /// When the key was invalidated since, the service is returned to the
    /// caller but not cached.
    pub fn insert_if_current(&self, key: CacheKey, service: Arc<T>, generation: u64) -> Arc<T> {
        if self.generation(&key) != generation {
            debug!(
                "Not caching service for {:?}: invalidated while loading",
                key.kb_ids
            );
            return service;
        }
        self.insert(key, service)
    }

    /// Insert a service, evicting the least recently used one when full
    pub fn insert(&self, key: CacheKey, service: Arc<T>) -> Arc<T> {
        let mut inner = self.lock();

        if let Some(slot) = inner.recency.get(&key).copied() {
            inner.slots[slot] = Some(service.clone());
            return service;
        }

        if inner.recency.len() == inner.recency.cap().get() {
            if let Some((evicted, slot)) = inner.recency.pop_lru() {
                debug!("Evicting cached service for {:?}", evicted.kb_ids);
                inner.release(slot);
                inner.stats.evictions += 1;
            }
        }

        let slot = match inner.free.pop() {
            Some(slot) => {
                inner.slots[slot] = Some(service.clone());
                slot
            }
            None => {
                inner.slots.push(Some(service.clone()));
                inner.slots.len() - 1
            }
        };
        inner.recency.put(key, slot);
        service
    }

    /// Drop every entry whose key mentions `kb_id`; returns how many were dropped
    pub fn invalidate_kb(&self, kb_id: &str) -> usize {
        let mut inner = self.lock();
        *inner.generations.entry(kb_id.to_string()).or_default() += 1;
        let stale: Vec<CacheKey> = inner
            .recency
            .iter()
            .filter(|(key, _)| key.mentions(kb_id))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some(slot) = inner.recency.pop(key) {
                inner.release(slot);
            }
        }
        if !stale.is_empty() {
            debug!("Invalidated {} cached services for '{}'", stale.len(), kb_id);
        }
        stale.len()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.recency.clear();
        inner.slots.clear();
        inner.free.clear();
        inner.epoch += 1;
    }

    pub fn len(&self) -> usize {
        self.lock().recency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            len: inner.recency.len(),
            ..inner.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ProviderIdentity {
        ProviderIdentity::new("hashing", "hash-64", "hashing")
    }

    fn key(kb_ids: &[&str], top_k: usize) -> CacheKey {
        let ids: Vec<String> = kb_ids.iter().map(|s| s.to_string()).collect();
        CacheKey::new(&ids, RetrieverKindChoice::Auto, &identity(), &top_k).unwrap()
    }

    #[test]
    fn test_key_ignores_kb_order() {
        assert_eq!(key(&["b", "a"], 5), key(&["a", "b", "a"], 5));
        assert_ne!(key(&["a"], 5), key(&["a"], 6));

        let other = ProviderIdentity::new("fastembed", "bge-small", "local");
        let ids = vec!["a".to_string()];
        assert_ne!(
            CacheKey::new(&ids, RetrieverKindChoice::Auto, &other, &5usize).unwrap(),
            key(&["a"], 5)
        );
    }

    #[test]
    fn test_hit_returns_same_instance() {
        let cache = ServiceCache::new(2);
        let stored = cache.insert(key(&["a"], 5), Arc::new("service".to_string()));
        let fetched = cache.get(&key(&["a"], 5)).unwrap();

        assert!(Arc::ptr_eq(&stored, &fetched));
        assert!(cache.get(&key(&["b"], 5)).is_none());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.len), (1, 1, 1));
    }

    #[test]
    fn test_lru_eviction_reuses_slots() {
        let cache = ServiceCache::new(2);
        cache.insert(key(&["a"], 5), Arc::new(1));
        cache.insert(key(&["b"], 5), Arc::new(2));
        // Touch "a" so "b" is least recent
        cache.get(&key(&["a"], 5));
        cache.insert(key(&["c"], 5), Arc::new(3));

        assert!(cache.get(&key(&["b"], 5)).is_none());
        assert_eq!(*cache.get(&key(&["a"], 5)).unwrap(), 1);
        assert_eq!(*cache.get(&key(&["c"], 5)).unwrap(), 3);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.lock().slots.len(), 2);
    }

    #[test]
    fn test_invalidate_kb_drops_only_mentions() {
        let cache = ServiceCache::new(4);
        cache.insert(key(&["a"], 5), Arc::new(1));
        cache.insert(key(&["a", "b"], 5), Arc::new(2));
        cache.insert(key(&["b"], 5), Arc::new(3));

        assert_eq!(cache.invalidate_kb("a"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(&["b"], 5)).is_some());
        assert_eq!(cache.invalidate_kb("missing"), 0);
    }

    #[test]
    fn test_load_finishing_after_invalidation_is_not_cached() {
        let cache = ServiceCache::new(4);
        let stale_key = key(&["a", "b"], 5);
        let generation = cache.generation(&stale_key);

        // A rebuild of "b" lands while the load is in flight
        cache.invalidate_kb("b");
        let returned = cache.insert_if_current(stale_key.clone(), Arc::new(1), generation);
        assert_eq!(*returned, 1);
        assert!(cache.is_empty());

        let generation = cache.generation(&stale_key);
        cache.insert_if_current(stale_key.clone(), Arc::new(2), generation);
        assert_eq!(*cache.peek(&stale_key).unwrap(), 2);
    }

    #[test]
    fn test_clear_moves_every_generation() {
        let cache: ServiceCache<i32> = ServiceCache::new(2);
        let k = key(&["a"], 5);
        let before = cache.generation(&k);
        cache.clear();
        assert_ne!(cache.generation(&k), before);
        assert_eq!(cache.generation(&key(&["z"], 5)), before + 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_load_lock() {
        let cache: ServiceCache<i32> = ServiceCache::new(2);
        let first = cache.load_lock(&key(&["a"], 5));
        let second = cache.load_lock(&key(&["a"], 5));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &cache.load_lock(&key(&["b"], 5))));

        let guard = first.lock().await;
        assert!(second.try_lock().is_err());
        drop(guard);
        assert!(second.try_lock().is_ok());

        drop((first, second));
        cache.load_lock(&key(&["c"], 5));
        assert_eq!(cache.lock().loading.len(), 1);
    }
}
