//! Key-partitioned concurrent stores
//!
//! State is split over a fixed number of shards, each a `parking_lot::Mutex`
//! around an `FxHashMap`. Two keys only contend when they hash to the same
//! shard, and no critical section ever awaits.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

const DEFAULT_SHARDS: usize = 32;

pub struct ShardedMap<K, V> {
    shards: Box<[Mutex<FxHashMap<K, V>>]>,
}

impl<K: Hash + Eq, V> ShardedMap<K, V> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let count = count.max(1);
        let shards = (0..count).map(|_| Mutex::new(FxHashMap::default())).collect();
        Self { shards }
    }

    #[inline]
    fn shard(&self, key: &K) -> &Mutex<FxHashMap<K, V>> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard(key).lock().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shard(key).lock().contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).lock().insert(key, value)
    }

    /// Insert only when the key is absent; returns true if inserted
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut shard = self.shard(&key).lock();
        if shard.contains_key(&key) {
            return false;
        }
        shard.insert(key, value);
        true
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).lock().remove(key)
    }

    /// Run `f` against the value for `key`, creating it with `V::default()` first if needed
    pub fn upsert<R>(&self, key: K, f: impl FnOnce(&mut V) -> R) -> R
    where
        V: Default,
    {
        let mut shard = self.shard(&key).lock();
        f(shard.entry(key).or_default())
    }

    /// Run `f` against an existing value; `None` when the key is absent
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.shard(key).lock().get_mut(key).map(f)
    }

    /// Read-only access without cloning
    pub fn with<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> R {
        f(self.shard(key).lock().get(key))
    }

    /// Remove the entry when `pred` holds for its current value
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut shard = self.shard(key).lock();
        if shard.get(key).is_some_and(pred) {
            shard.remove(key)
        } else {
            None
        }
    }

    /// Keep only entries matching `pred`, shard by shard
    pub fn retain(&self, mut pred: impl FnMut(&K, &mut V) -> bool) {
        for shard in self.shards.iter() {
            shard.lock().retain(|k, v| pred(k, v));
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    /// Snapshot of all values (shards locked one at a time)
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            out.extend(shard.lock().values().cloned());
        }
        out
    }
}

impl<K: Hash + Eq, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-key async mutual exclusion
///
/// Holding the guard serializes every mutation of one key, including work
/// that awaits collaborators, while unrelated keys proceed in parallel.
pub struct KeyLocks<K> {
    locks: ShardedMap<K, Arc<tokio::sync::Mutex<()>>>,
}

impl<K: Hash + Eq + Clone> KeyLocks<K> {
    pub fn new() -> Self {
        Self { locks: ShardedMap::new() }
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = self.locks.upsert(key.clone(), |slot| slot.clone());
        lock.lock_owned().await
    }

    /// Drop lock entries nobody is holding or waiting on
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Hash + Eq + Clone> Default for KeyLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
