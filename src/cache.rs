// ============================================================================
// BOUNDED CACHE
// ============================================================================
// Fixed-capacity map with dual eviction:
// - capacity: least-recently-used entry goes first
// - age: entries expire `ttl` after their last write
//
// Entries live in a slab arena linked into an intrusive recency list, so
// lookups, inserts and evictions are O(1) with no per-entry allocation once
// the arena is warm. `ShardedCache` spreads keys across independently locked
// shards so unrelated keys rarely contend.
// ============================================================================

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::types::Instant;

const NIL: usize = usize::MAX;

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters describing cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub len: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub capacity_evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    fn merge(&mut self, other: &CacheStats) {
        self.len += other.len;
        self.capacity += other.capacity;
        self.hits += other.hits;
        self.misses += other.misses;
        self.capacity_evictions += other.capacity_evictions;
        self.expirations += other.expirations;
    }
}

// ----------------------------------------------------------------------------
// Arena-backed LRU + TTL Cache
// ----------------------------------------------------------------------------

struct Entry<K, V> {
    key: K,
    value: V,
    expires_at: Option<Instant>,
}

struct Slot<K, V> {
    entry: Option<Entry<K, V>>,
    prev: usize,
    next: usize,
}

/// Single-threaded bounded cache. Wrap in a lock (or use [`ShardedCache`])
/// for shared access.
pub struct BoundedCache<K, V> {
    capacity: usize,
    ttl: Option<Duration>,
    index: HashMap<K, usize, ahash::RandomState>,
    slots: Vec<Slot<K, V>>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
    stats: CacheStats,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// `capacity` is clamped to at least one entry. `ttl = None` disables
    /// age-based eviction.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ttl,
            index: HashMap::with_capacity_and_hasher(capacity.min(4096), ahash::RandomState::new()),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            stats: CacheStats::default(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            len: self.len(),
            capacity: self.capacity,
            ..self.stats
        }
    }

    /// Look up a live entry and mark it most recently used.
    pub fn get<Q>(&mut self, key: &Q, now: Instant) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.live_index(key, now)?;
        self.move_to_front(idx);
        self.slots[idx].entry.as_ref().map(|e| &e.value)
    }

    /// Mutable lookup; marks the entry most recently used. Does not extend
    /// its lifetime.
    pub fn get_mut<Q>(&mut self, key: &Q, now: Instant) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.live_index(key, now)?;
        self.move_to_front(idx);
        self.slots[idx].entry.as_mut().map(|e| &mut e.value)
    }

    /// Look up without touching recency or statistics.
    pub fn peek<Q>(&self, key: &Q, now: Instant) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.index.get(key)?;
        let entry = self.slots[idx].entry.as_ref()?;
        match entry.expires_at {
            Some(deadline) if deadline <= now => None,
            _ => Some(&entry.value),
        }
    }

    /// Insert or overwrite. Overwriting refreshes both recency and expiry.
    /// Returns the entry evicted to make room, if any.
    pub fn insert(&mut self, key: K, value: V, now: Instant) -> Option<(K, V)> {
        let expires_at = self.ttl.map(|ttl| now + ttl);

        if let Some(&idx) = self.index.get(&key) {
            if let Some(entry) = self.slots[idx].entry.as_mut() {
                entry.value = value;
                entry.expires_at = expires_at;
            }
            self.move_to_front(idx);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.evict_lru()
        } else {
            None
        };

        let entry = Entry {
            key: key.clone(),
            value,
            expires_at,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx].entry = Some(entry);
                idx
            }
            None => {
                self.slots.push(Slot {
                    entry: Some(entry),
                    prev: NIL,
                    next: NIL,
                });
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.index.insert(key, idx);
        evicted
    }

    /// Refresh an existing entry's recency and expiry. Returns false when the
    /// key is absent or already expired.
    pub fn touch<Q>(&mut self, key: &Q, now: Instant) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(idx) = self.live_index(key, now) else {
            return false;
        };
        let expires_at = self.ttl.map(|ttl| now + ttl);
        if let Some(entry) = self.slots[idx].entry.as_mut() {
            entry.expires_at = expires_at;
        }
        self.move_to_front(idx);
        true
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.index.remove(key)?;
        self.release(idx).map(|(_, v)| v)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let expired: Vec<K> = self
            .slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|e| matches!(e.expires_at, Some(deadline) if deadline <= now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            if let Some(idx) = self.index.remove(key) {
                self.release(idx);
            }
        }
        self.stats.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Rebuild the arena without holes and release spare capacity.
    pub fn shrink_to_fit(&mut self) {
        let mut old = std::mem::take(&mut self.slots);
        let mut order = Vec::with_capacity(self.index.len());
        let mut cursor = self.tail;
        while cursor != NIL {
            let next = old[cursor].prev;
            if let Some(entry) = old[cursor].entry.take() {
                order.push(entry);
            }
            cursor = next;
        }
        self.index.clear();
        self.index.shrink_to_fit();
        self.free = Vec::new();
        self.head = NIL;
        self.tail = NIL;
        self.slots = Vec::with_capacity(order.len());
        // Re-inserting oldest first leaves the most recent entry at the head.
        for entry in order {
            let idx = self.slots.len();
            let key = entry.key.clone();
            self.slots.push(Slot {
                entry: Some(entry),
                prev: NIL,
                next: NIL,
            });
            self.push_front(idx);
            self.index.insert(key, idx);
        }
    }

    /// Iterate live entries from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            while cursor != NIL {
                let slot = &self.slots[cursor];
                cursor = slot.next;
                if let Some(entry) = slot.entry.as_ref() {
                    return Some((&entry.key, &entry.value));
                }
            }
            None
        })
    }

    // ---- internals ----

    fn live_index<Q>(&mut self, key: &Q, now: Instant) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(&idx) = self.index.get(key) else {
            self.stats.misses += 1;
            return None;
        };
        let expired = self.slots[idx]
            .entry
            .as_ref()
            .map(|e| matches!(e.expires_at, Some(deadline) if deadline <= now))
            .unwrap_or(true);
        if expired {
            self.index.remove(key);
            self.release(idx);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }
        self.stats.hits += 1;
        Some(idx)
    }

    fn evict_lru(&mut self) -> Option<(K, V)> {
        let idx = self.tail;
        if idx == NIL {
            return None;
        }
        let (key, value) = self.release(idx)?;
        self.index.remove(&key);
        self.stats.capacity_evictions += 1;
        Some((key, value))
    }

    fn release(&mut self, idx: usize) -> Option<(K, V)> {
        self.unlink(idx);
        let entry = self.slots[idx].entry.take()?;
        self.free.push(idx);
        Some((entry.key, entry.value))
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else if self.tail == idx {
            self.tail = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }
}

// ----------------------------------------------------------------------------
// Sharded Cache
// ----------------------------------------------------------------------------

/// A [`BoundedCache`] split into independently locked shards.
///
/// Capacity is divided evenly, so eviction is LRU per shard rather than
/// globally exact.
pub struct ShardedCache<K, V> {
    shards: Box<[Mutex<BoundedCache<K, V>>]>,
    hasher: ahash::RandomState,
}

impl<K, V> ShardedCache<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(capacity: usize, ttl: Option<Duration>, shard_count: usize) -> Self {
        let shard_count = shard_count.clamp(1, capacity.max(1));
        let per_shard = capacity.max(1).div_ceil(shard_count);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(BoundedCache::new(per_shard, ttl)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: ahash::RandomState::new(),
        }
    }

    /// Lock the shard owning `key`.
    pub fn shard<Q>(&self, key: &Q) -> MutexGuard<'_, BoundedCache<K, V>>
    where
        Q: Hash + ?Sized,
    {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        self.shards[idx].lock()
    }

    pub fn get_cloned<Q>(&self, key: &Q, now: Instant) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shard(key).get(key, now).cloned()
    }

    pub fn insert(&self, key: K, value: V, now: Instant) -> Option<(K, V)> {
        let mut shard = self.shard(&key);
        shard.insert(key, value, now)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).remove(key)
    }

    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.shards.iter().map(|s| s.lock().sweep_expired(now)).sum()
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }

    pub fn shrink_to_fit(&self) {
        for shard in self.shards.iter() {
            shard.lock().shrink_to_fit();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for shard in self.shards.iter() {
            total.merge(&shard.lock().stats());
        }
        total
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Clock;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lru_eviction_order() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let mut cache = BoundedCache::new(2, None);

        cache.insert("a", 1, now);
        cache.insert("b", 2, now);
        // Touch "a" so "b" becomes least recently used.
        assert_eq!(cache.get("a", now), Some(&1));
        let evicted = cache.insert("c", 3, now);

        assert_eq!(evicted, Some(("b", 2)));
        assert_eq!(cache.len(), 2);
        assert!(cache.peek("b", now).is_none());
        assert_eq!(cache.stats().capacity_evictions, 1);
    }

    #[test]
    fn test_ttl_expiry_and_refresh() {
        let (clock, mock) = Clock::mock();
        let mut cache = BoundedCache::new(10, Some(Duration::from_secs(60)));

        cache.insert("k", "v", clock.now());
        mock.increment(Duration::from_secs(59));
        assert!(cache.touch("k", clock.now()));

        mock.increment(Duration::from_secs(59));
        assert_eq!(cache.get("k", clock.now()), Some(&"v"));

        mock.increment(Duration::from_secs(2));
        assert_eq!(cache.get("k", clock.now()), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_sweep_and_slot_reuse() {
        let (clock, mock) = Clock::mock();
        let mut cache = BoundedCache::new(4, Some(Duration::from_secs(10)));
        for i in 0..4 {
            cache.insert(i, i * 10, clock.now());
        }
        mock.increment(Duration::from_secs(5));
        cache.insert(0, 0, clock.now());
        mock.increment(Duration::from_secs(6));

        assert_eq!(cache.sweep_expired(clock.now()), 3);
        assert_eq!(cache.len(), 1);

        cache.insert(7, 70, clock.now());
        cache.insert(8, 80, clock.now());
        cache.shrink_to_fit();
        let keys: Vec<_> = cache.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![8, 7, 0]);
    }

    #[test]
    fn test_overwrite_moves_to_front() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let mut cache = BoundedCache::new(3, None);
        cache.insert(1, "a", now);
        cache.insert(2, "b", now);
        cache.insert(1, "a2", now);

        let order: Vec<_> = cache.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(order, vec![(1, "a2"), (2, "b")]);
        assert_eq!(cache.remove(&2), Some("b"));
        assert_eq!(cache.iter().count(), 1);
    }

    #[test]
    fn test_sharded_cache_bounds_total_size() {
        let (clock, _mock) = Clock::mock();
        let cache: ShardedCache<u64, u64> = ShardedCache::new(64, None, 8);
        for i in 0..1_000 {
            cache.insert(i, i, clock.now());
        }
        assert!(cache.len() <= 64);
        assert_eq!(cache.stats().capacity, 64);

        cache.insert(5_000, 1, clock.now());
        assert_eq!(cache.get_cloned(&5_000, clock.now()), Some(1));
        cache.clear();
        assert!(cache.is_empty());
    }
}
