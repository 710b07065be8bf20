//! In-process mirror of a kernel table.

use lbmap_common::Result;
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{Mutex, MutexGuard, PoisonError},
};

pub const CACHE_SHARDS: usize = 16;

pub(crate) type Shard<K, V> = HashMap<Vec<u8>, (K, V)>;

/// Userspace mirror of a kernel table, keyed by the encoded key bytes.
///
/// A shard stays locked for the whole of a table operation, kernel call
/// included, so one handle can never leave the cache and the kernel
/// disagreeing about a key. Keys in different shards proceed in parallel.
pub(crate) struct ShardedCache<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
}

impl<K: Clone, V: Clone> ShardedCache<K, V> {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(CACHE_SHARDS);
        for _ in 0..CACHE_SHARDS {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len().max(1)
    }

    pub fn shard(&self, key: &[u8]) -> MutexGuard<'_, Shard<K, V>> {
        let idx = self.shard_index(key);
        lock(&self.shards[idx])
    }

    /// Copy of every cached entry. Shards are copied one after another, so
    /// the result reflects each key's latest completed operation.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let mut entries = Vec::new();
        for shard in &self.shards {
            let guard = lock(shard);
            entries.extend(guard.values().cloned());
        }
        entries
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    /// Replace the whole contents with what `load` returns. Every shard
    /// stays locked while `load` runs, so no concurrent write can slip in
    /// between reading the source and installing the result.
    pub fn rebuild<F>(&self, load: F) -> Result<usize>
    where
        F: FnOnce() -> Result<Vec<(Vec<u8>, (K, V))>>,
    {
        let mut guards: Vec<_> = self.shards.iter().map(lock).collect();
        let entries = load()?;
        let count = entries.len();
        for guard in guards.iter_mut() {
            guard.clear();
        }
        for (raw, entry) in entries {
            let idx = self.shard_index(&raw);
            guards[idx].insert(raw, entry);
        }
        Ok(count)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
