//! Bounded sampler cache with least-recently-used eviction.
//!
//! Guarantees:
//! - at most one build per key while the key stays resident
//! - a failing build leaves the cache exactly as it was
//! - an absent key disables caching for that call

use crate::models::Result;
use crate::sampler::TokenSampler;
use serde::Serialize;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

const NIL: usize = usize::MAX;

struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Explicit LRU structure: a slab-backed recency list plus a key index.
///
/// Promote and evict are O(1). `head` is the most recently used entry,
/// `tail` the least.
pub struct LruIndex<K, V> {
    capacity: usize,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: usize,
    tail: usize,
}

impl<K: Eq + Hash + Clone, V> LruIndex<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Look up without touching recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.index.get(key)?;
        Some(&self.node(slot).value)
    }

    /// Look up and promote to most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.index.get(key)?;
        self.promote(slot);
        Some(&self.node(slot).value)
    }

    /// Insert as most recently used.
    ///
    /// A resident key has its value replaced. Otherwise, when full, the least
    /// recently used entry is evicted first and returned. With zero capacity
    /// the pair itself comes straight back.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            self.node_mut(slot).value = value;
            self.promote(slot);
            return None;
        }
        if self.capacity == 0 {
            return Some((key, value));
        }

        let evicted = if self.len() >= self.capacity {
            self.pop_lru()
        } else {
            None
        };

        let node = Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.attach_front(slot);

        evicted
    }

    /// Remove the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        self.detach(slot);
        let node = self.slots[slot].take()?;
        self.free.push(slot);
        self.index.remove(&node.key);
        Some((node.key, node.value))
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<&K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while cursor != NIL {
            let node = self.node(cursor);
            keys.push(&node.key);
            cursor = node.next;
        }
        keys
    }

    fn node(&self, slot: usize) -> &Node<K, V> {
        self.slots[slot]
            .as_ref()
            .expect("linked slot is occupied")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<K, V> {
        self.slots[slot]
            .as_mut()
            .expect("linked slot is occupied")
    }

    fn promote(&mut self, slot: usize) {
        if self.head != slot {
            self.detach(slot);
            self.attach_front(slot);
        }
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
        let node = self.node_mut(slot);
        node.prev = NIL;
        node.next = NIL;
    }

    fn attach_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(slot);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head == NIL {
            self.tail = slot;
        } else {
            self.node_mut(old_head).prev = slot;
        }
        self.head = slot;
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Builds performed with caching disabled
    pub uncached_builds: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Keyed store of constructed samplers.
///
/// The read-check-build-insert sequence runs under one lock, so concurrent
/// callers resolving the same unpopulated key observe a single build. The
/// lock is never held across an await point.
pub struct SamplerCache<S = TokenSampler> {
    entries: Mutex<LruIndex<String, Arc<S>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    uncached_builds: AtomicU64,
}

impl<S> SamplerCache<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruIndex::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            uncached_builds: AtomicU64::new(0),
        }
    }

    /// A builder that panicked poisons the mutex, but the index is only
    /// mutated after a successful build, so the guard is still consistent.
    fn lock(&self) -> MutexGuard<'_, LruIndex<String, Arc<S>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the sampler for `key`, building it on a miss.
    ///
    /// - `None` key: `build` runs every call and nothing is stored.
    /// - resident key: the stored `Arc` is returned and promoted; `build` is not called.
    /// - missing key: `build` runs once; on success the least recently used
    ///   entry is evicted if the cache is full, then the result is stored.
    pub fn resolve<F>(&self, key: Option<&str>, build: F) -> Result<Arc<S>>
    where
        F: FnOnce() -> Result<S>,
    {
        let Some(key) = key else {
            self.uncached_builds.fetch_add(1, Ordering::Relaxed);
            return build().map(Arc::new);
        };

        let mut entries = self.lock();
        if let Some(sampler) = entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Sampler cache hit");
            return Ok(Arc::clone(sampler));
        }

        let sampler = Arc::new(build()?);
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some((evicted, _)) = entries.insert(key.to_string(), Arc::clone(&sampler)) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key, evicted = %evicted, "Evicted least recently used sampler");
        } else {
            debug!(key, size = entries.len(), "Cached new sampler");
        }
        Ok(sampler)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    /// Resident keys, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().into_iter().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let (len, capacity) = {
            let entries = self.lock();
            (entries.len(), entries.capacity())
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            uncached_builds: self.uncached_builds.load(Ordering::Relaxed),
            len,
            capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CtrlError;
    use std::cell::Cell;

    #[test]
    fn test_lru_index_order() {
        let mut lru = LruIndex::new(3);
        lru.insert("a", 1);
        lru.insert("b", 2);
        lru.insert("c", 3);
        assert_eq!(lru.keys(), vec![&"c", &"b", &"a"]);

        lru.get("a");
        assert_eq!(lru.keys(), vec![&"a", &"c", &"b"]);

        assert_eq!(lru.peek("b"), Some(&2));
        assert_eq!(lru.keys(), vec![&"a", &"c", &"b"]);

        let evicted = lru.insert("d", 4);
        assert_eq!(evicted, Some(("b", 2)));
        assert_eq!(lru.keys(), vec![&"d", &"a", &"c"]);
    }

    #[test]
    fn test_lru_index_reuses_slots() {
        let mut lru = LruIndex::new(1);
        for i in 0..10 {
            lru.insert(i, i * 10);
        }
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.peek(&9), Some(&90));
        assert_eq!(lru.slots.len(), 1);
    }

    #[test]
    fn test_lru_index_zero_capacity() {
        let mut lru = LruIndex::new(0);
        assert_eq!(lru.insert("a", 1), Some(("a", 1)));
        assert!(lru.is_empty());
    }

    #[test]
    fn test_lru_index_replace_promotes() {
        let mut lru = LruIndex::new(2);
        lru.insert("a", 1);
        lru.insert("b", 2);
        assert_eq!(lru.insert("a", 10), None);
        assert_eq!(lru.keys(), vec![&"a", &"b"]);
        assert_eq!(lru.pop_lru(), Some(("b", 2)));
        assert_eq!(lru.pop_lru(), Some(("a", 10)));
        assert_eq!(lru.pop_lru(), None);
    }

    #[test]
    fn test_same_key_builds_once() {
        let cache: SamplerCache<String> = SamplerCache::new(2);
        let builds = Cell::new(0);
        let build = || {
            builds.set(builds.get() + 1);
            Ok("sampler".to_string())
        };

        let first = cache.resolve(Some("concert_singer"), build).unwrap();
        for _ in 0..9 {
            let again = cache
                .resolve(Some("concert_singer"), || {
                    builds.set(builds.get() + 1);
                    Ok("other".to_string())
                })
                .unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }

        assert_eq!(builds.get(), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 9);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.len, 1);
    }

    #[test]
    fn test_overflow_evicts_least_recently_used() {
        let cache: SamplerCache<usize> = SamplerCache::new(2);
        cache.resolve(Some("a"), || Ok(1)).unwrap();
        cache.resolve(Some("b"), || Ok(2)).unwrap();

        // touching "a" makes "b" the eviction candidate
        cache.resolve(Some("a"), || Ok(99)).unwrap();
        cache.resolve(Some("c"), || Ok(3)).unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.keys(), vec!["c".to_string(), "a".to_string()]);
        assert_eq!(cache.stats().evictions, 1);

        cache.resolve(Some("d"), || Ok(4)).unwrap();
        assert_eq!(cache.keys(), vec!["d".to_string(), "c".to_string()]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_disabled_caching_builds_every_call() {
        let cache: SamplerCache<usize> = SamplerCache::new(4);
        let builds = Cell::new(0);
        for _ in 0..5 {
            cache
                .resolve(None, || {
                    builds.set(builds.get() + 1);
                    Ok(builds.get())
                })
                .unwrap();
        }
        assert_eq!(builds.get(), 5);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().uncached_builds, 5);
    }

    #[test]
    fn test_failed_build_leaves_no_entry() {
        let cache: SamplerCache<usize> = SamplerCache::new(1);
        cache.resolve(Some("a"), || Ok(1)).unwrap();

        let err = cache
            .resolve(Some("b"), || {
                Err(CtrlError::SamplerBuildFailure("grammar rejected".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, CtrlError::SamplerBuildFailure(_)));

        // the resident entry survived and nothing partial was stored
        assert_eq!(cache.keys(), vec!["a".to_string()]);
        assert_eq!(cache.stats().evictions, 0);

        let builds = Cell::new(0);
        cache
            .resolve(Some("b"), || {
                builds.set(builds.get() + 1);
                Ok(2)
            })
            .unwrap();
        cache.resolve(Some("b"), || Ok(3)).unwrap();
        assert_eq!(builds.get(), 1);
    }

    #[test]
    fn test_concurrent_resolve_builds_once() {
        let cache: Arc<SamplerCache<usize>> = Arc::new(SamplerCache::new(1));
        let builds = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                std::thread::spawn(move || {
                    cache
                        .resolve(Some("shared"), || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok(7)
                        })
                        .unwrap()
                })
            })
            .collect();

        let samplers: Vec<Arc<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(samplers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_panicking_build_does_not_disable_cache() {
        let cache: Arc<SamplerCache<usize>> = Arc::new(SamplerCache::new(2));
        cache.resolve(Some("a"), || Ok(1)).unwrap();

        let worker = Arc::clone(&cache);
        let outcome = std::thread::spawn(move || {
            worker.resolve(Some("bad"), || panic!("potential factory blew up"))
        })
        .join();
        assert!(outcome.is_err());

        let good = cache.resolve(Some("good"), || Ok(2)).unwrap();
        assert_eq!(*good, 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("bad"));
        assert_eq!(cache.keys(), vec!["good".to_string(), "a".to_string()]);
        assert_eq!(cache.stats().len, 2);
    }
}
