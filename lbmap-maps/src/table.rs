//! Generic cached kernel-shared table.
//!
//! [`Table`] turns typed keys and values into raw records through their
//! [`Record`] codec, issues the syscall through its [`RawMap`] and, when the
//! identity asks for it, keeps an in-process mirror that is updated under
//! the same lock as the kernel call.

use crate::backend::{MapBackend, MapSpec, RawMap, UpdateFlags};
use crate::cache::ShardedCache;
use lbmap_common::{metrics::TableMetrics, Error, Record, Result};
use log::{debug, info, warn};
use std::sync::Arc;

/// Handle to one kernel table holding `K -> V` records.
pub struct Table<K: Record, V: Record> {
    spec: MapSpec,
    map: Arc<dyn RawMap>,
    cache: Option<ShardedCache<K, V>>,
    metrics: Arc<TableMetrics>,
}

impl<K: Record, V: Record> Table<K, V> {
    /// Open the table described by `spec`, creating it if needed.
    ///
    /// Layouts are validated here, once. A cached handle starts out with the
    /// current kernel contents so that iteration also covers entries written
    /// before this handle existed.
    pub fn open<B: MapBackend>(backend: &B, spec: MapSpec) -> Result<Self> {
        K::check_layout()?;
        V::check_layout()?;
        if spec.key != K::layout() || spec.value != V::layout() {
            return Err(spec.incompatible(format!(
                "identity declares {} -> {} but the handle is typed {} -> {}",
                spec.key.name,
                spec.value.name,
                K::layout().name,
                V::layout().name
            )));
        }

        let map = backend.open_or_create::<K, V>(&spec)?;
        let table = Self {
            cache: spec.cache.then(ShardedCache::new),
            spec,
            map,
            metrics: Arc::new(TableMetrics::new()),
        };

        if table.cache.is_some() {
            let entries = table.resync()?;
            info!("Opened map {} with {} cached entries", table.name(), entries);
        } else {
            info!("Opened map {}", table.name());
        }

        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &MapSpec {
        &self.spec
    }

    pub fn metrics(&self) -> Arc<TableMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// Look a key up, serving from the cache when possible. A kernel hit on
    /// a cached table is remembered.
    pub fn lookup(&self, key: &K) -> Result<Option<V>> {
        self.metrics.lookups.increment();
        let raw_key = key.encode();

        let Some(cache) = &self.cache else {
            return self.observe(self.kernel_lookup(&raw_key));
        };

        let mut shard = cache.shard(&raw_key);
        if let Some((_, value)) = shard.get(raw_key.as_ref()) {
            self.metrics.cache_hits.increment();
            return Ok(Some(value.clone()));
        }

        let value = self.observe(self.kernel_lookup(&raw_key))?;
        if let Some(value) = &value {
            shard.insert(raw_key.to_vec(), (key.clone(), value.clone()));
            self.metrics.entries.increment();
        }
        Ok(value)
    }

    /// Insert or overwrite one record. Either the record is written and
    /// cached, or nothing changes.
    pub fn insert(&self, key: &K, value: &V) -> Result<()> {
        self.write(key, value, UpdateFlags::Any)
    }

    /// Insert only if the key is absent. Returns `false` if it was present.
    pub fn insert_new(&self, key: &K, value: &V) -> Result<bool> {
        match self.write(key, value, UpdateFlags::NoExist) {
            Ok(()) => Ok(true),
            Err(Error::KeyExists { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn write(&self, key: &K, value: &V, flags: UpdateFlags) -> Result<()> {
        let raw_key = key.encode();
        let raw_value = value.encode();

        let Some(cache) = &self.cache else {
            self.observe(self.map.update(&raw_key, &raw_value, flags))?;
            self.metrics.inserts.increment();
            return Ok(());
        };

        let mut shard = cache.shard(&raw_key);
        self.observe(self.map.update(&raw_key, &raw_value, flags))?;
        if shard
            .insert(raw_key.to_vec(), (key.clone(), value.clone()))
            .is_none()
        {
            self.metrics.entries.increment();
        }
        self.metrics.inserts.increment();
        debug!("Updated {} in map {}", key, self.name());
        Ok(())
    }

    /// Remove one record from the kernel and the cache. Returns `false` if
    /// the kernel did not have it.
    pub fn delete(&self, key: &K) -> Result<bool> {
        let raw_key = key.encode();

        let Some(cache) = &self.cache else {
            let removed = self.observe(self.map.delete(&raw_key))?;
            if removed {
                self.metrics.deletes.increment();
            }
            return Ok(removed);
        };

        let mut shard = cache.shard(&raw_key);
        let removed = self.observe(self.map.delete(&raw_key))?;
        if shard.remove(raw_key.as_ref()).is_some() {
            self.metrics.entries.decrement();
        }
        if removed {
            self.metrics.deletes.increment();
            debug!("Deleted {} from map {}", key, self.name());
        }
        Ok(removed)
    }

    /// Iterate over a point-in-time view of the table.
    ///
    /// Cached tables iterate over a copy of the cache; others over a dump of
    /// the kernel table whose records are decoded lazily, malformed ones
    /// being logged and skipped. Every call starts a fresh iteration.
    pub fn iter(&self) -> Result<Entries<K, V>> {
        let source = match &self.cache {
            Some(cache) => Source::Cached(cache.snapshot().into_iter()),
            None => Source::Raw(self.observe(self.map.dump())?.into_iter()),
        };
        Ok(Entries {
            source,
            table: self.spec.name.clone(),
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Read every record from the kernel, bypassing the cache.
    pub fn dump(&self) -> Result<Vec<(K, V)>> {
        let raw = self.observe(self.map.dump())?;
        Ok(Entries {
            source: Source::Raw(raw.into_iter()),
            table: self.spec.name.clone(),
            metrics: Arc::clone(&self.metrics),
        }
        .collect())
    }

    /// Number of entries, from the cache when there is one.
    pub fn len(&self) -> Result<usize> {
        match &self.cache {
            Some(cache) => Ok(cache.len()),
            None => self.observe(self.map.count()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Rebuild the cache from the kernel table, dropping whatever another
    /// writer changed behind our back. Returns the number of cached entries.
    pub fn resync(&self) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return self.len();
        };

        let count = cache.rebuild(|| {
            Ok(self
                .dump()?
                .into_iter()
                .map(|(key, value)| (key.encode().to_vec(), (key, value)))
                .collect())
        })?;
        self.metrics.entries.set(count as u64);
        Ok(count)
    }

    /// Delete every record the kernel currently holds. Returns how many
    /// were removed.
    pub fn flush(&self) -> Result<usize> {
        let mut removed = 0;
        for (key, _) in self.dump()? {
            if self.delete(&key)? {
                removed += 1;
            }
        }
        // drop cached entries another writer already removed
        self.resync()?;
        info!("Flushed {} entries from map {}", removed, self.name());
        Ok(removed)
    }

    fn kernel_lookup(&self, raw_key: &[u8]) -> Result<Option<V>> {
        self.map
            .lookup(raw_key)?
            .map(|raw| V::decode(&raw))
            .transpose()
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            // expected outcome of a create-only insert
            Err(Error::KeyExists { .. }) => {}
            Err(_) => self.metrics.errors.increment(),
            Ok(_) => {}
        }
        result
    }
}

enum Source<K, V> {
    Cached(std::vec::IntoIter<(K, V)>),
    Raw(std::vec::IntoIter<(Vec<u8>, Vec<u8>)>),
}

/// Iterator returned by [`Table::iter`].
pub struct Entries<K, V> {
    source: Source<K, V>,
    table: String,
    metrics: Arc<TableMetrics>,
}

impl<K: Record, V: Record> Iterator for Entries<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            Source::Cached(entries) => entries.next(),
            Source::Raw(records) => {
                for (raw_key, raw_value) in records.by_ref() {
                    match (K::decode(&raw_key), V::decode(&raw_value)) {
                        (Ok(key), Ok(value)) => return Some((key, value)),
                        (Err(err), _) | (_, Err(err)) => {
                            self.metrics.malformed.increment();
                            warn!("Skipping record in map {}: {}", self.table, err);
                        }
                    }
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MapKind;
    use crate::memory::MemoryBackend;
    use lbmap_common::types::{AffinityMatchKey, AffinityMatchValue, BackendId, RevNatId};

    type AffinityTable = Table<AffinityMatchKey, AffinityMatchValue>;

    fn spec(max: u32) -> MapSpec {
        MapSpec::new::<AffinityMatchKey, AffinityMatchValue>("table", MapKind::Hash, max)
    }

    fn key(backend: u32) -> AffinityMatchKey {
        AffinityMatchKey::new(BackendId(backend), RevNatId(100))
    }

    fn value() -> AffinityMatchValue {
        AffinityMatchValue::new()
    }

    #[test]
    fn insert_lookup_delete_with_and_without_cache() {
        for cached in [false, true] {
            let backend = MemoryBackend::new();
            let spec = if cached { spec(8).with_cache() } else { spec(8) };
            let table = AffinityTable::open(&backend, spec).unwrap();
            assert_eq!(table.is_cached(), cached);

            assert_eq!(table.lookup(&key(1)).unwrap(), None);
            table.insert(&key(1), &value()).unwrap();
            assert_eq!(table.lookup(&key(1)).unwrap(), Some(value()));
            assert_eq!(table.len().unwrap(), 1);

            assert!(table.delete(&key(1)).unwrap());
            assert!(!table.delete(&key(1)).unwrap());
            assert_eq!(table.lookup(&key(1)).unwrap(), None);
            assert!(table.is_empty().unwrap());
        }
    }

    #[test]
    fn cached_lookup_avoids_the_kernel() {
        let backend = MemoryBackend::new();
        let table = AffinityTable::open(&backend, spec(8).with_cache()).unwrap();
        table.insert(&key(1), &value()).unwrap();

        // every kernel call would fail now
        backend.get("table").unwrap().fail_next(u32::MAX);
        assert_eq!(table.lookup(&key(1)).unwrap(), Some(value()));
        assert_eq!(table.metrics().snapshot().cache_hits, 1);
        backend.get("table").unwrap().fail_next(0);
    }

    #[test]
    fn cache_is_primed_from_existing_entries() {
        let backend = MemoryBackend::new();
        let first = AffinityTable::open(&backend, spec(8)).unwrap();
        first.insert(&key(1), &value()).unwrap();
        first.insert(&key(2), &value()).unwrap();

        let second = AffinityTable::open(&backend, spec(8).with_cache()).unwrap();
        assert_eq!(second.len().unwrap(), 2);
        let mut keys: Vec<_> = second.iter().unwrap().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec![key(1), key(2)]);
    }

    #[test]
    fn open_rejects_mistyped_identity() {
        let backend = MemoryBackend::new();
        let mut spec = spec(8);
        spec.key = AffinityMatchValue::layout();
        assert!(matches!(
            AffinityTable::open(&backend, spec),
            Err(Error::IncompatibleLayout { .. })
        ));
    }

    #[test]
    fn insert_new_reports_existing_key() {
        let backend = MemoryBackend::new();
        let table = AffinityTable::open(&backend, spec(8).with_cache()).unwrap();
        assert!(table.insert_new(&key(1), &value()).unwrap());
        assert!(!table.insert_new(&key(1), &value()).unwrap());
        assert_eq!(table.len().unwrap(), 1);

        let stats = table.metrics().snapshot();
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.inserts, 1);
    }

    #[test]
    fn capacity_exceeded_leaves_nothing_behind() {
        for cached in [false, true] {
            let backend = MemoryBackend::new();
            let spec = if cached { spec(2).with_cache() } else { spec(2) };
            let table = AffinityTable::open(&backend, spec).unwrap();
            table.insert(&key(1), &value()).unwrap();
            table.insert(&key(2), &value()).unwrap();

            assert!(matches!(
                table.insert(&key(3), &value()),
                Err(Error::CapacityExceeded { max_entries: 2, .. })
            ));
            assert_eq!(table.lookup(&key(3)).unwrap(), None);
            assert_eq!(table.len().unwrap(), 2);
            assert_eq!(table.metrics().snapshot().errors, 1);
        }
    }

    #[test]
    fn failed_kernel_update_does_not_touch_the_cache() {
        let backend = MemoryBackend::new();
        let table = AffinityTable::open(&backend, spec(8).with_cache()).unwrap();
        backend.get("table").unwrap().fail_next(1);

        assert!(table.insert(&key(1), &value()).unwrap_err().is_transient());
        assert_eq!(table.len().unwrap(), 0);
        assert_eq!(table.lookup(&key(1)).unwrap(), None);
    }

    #[test]
    fn iteration_is_restartable_and_reflects_own_writes() {
        let backend = MemoryBackend::new();
        let table = AffinityTable::open(&backend, spec(8).with_cache()).unwrap();
        table.insert(&key(1), &value()).unwrap();

        let before: Vec<_> = table.iter().unwrap().collect();
        table.insert(&key(2), &value()).unwrap();
        let after: Vec<_> = table.iter().unwrap().collect();

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn malformed_records_are_skipped() {
        let backend = MemoryBackend::new();
        let table = AffinityTable::open(&backend, spec(8)).unwrap();
        table.insert(&key(1), &value()).unwrap();
        let raw = backend.get("table").unwrap();
        raw.inject_raw(vec![1, 2, 3], vec![0]);
        raw.inject_raw(key(9).encode().to_vec(), vec![0, 0]);

        let entries: Vec<_> = table.iter().unwrap().collect();
        assert_eq!(entries, vec![(key(1), value())]);
        assert_eq!(table.metrics().snapshot().malformed, 2);
    }

    #[test]
    fn resync_repairs_foreign_writes() {
        let backend = MemoryBackend::new();
        let table = AffinityTable::open(&backend, spec(8).with_cache()).unwrap();
        table.insert(&key(1), &value()).unwrap();

        let foreign = AffinityTable::open(&backend, spec(8)).unwrap();
        foreign.delete(&key(1)).unwrap();
        foreign.insert(&key(2), &value()).unwrap();

        // the cache still believes the old state
        assert_eq!(table.lookup(&key(1)).unwrap(), Some(value()));
        assert_eq!(table.resync().unwrap(), 1);
        assert_eq!(table.lookup(&key(1)).unwrap(), None);
        assert_eq!(table.lookup(&key(2)).unwrap(), Some(value()));
    }

    #[test]
    fn flush_empties_kernel_and_cache() {
        let backend = MemoryBackend::new();
        let table = AffinityTable::open(&backend, spec(8).with_cache()).unwrap();
        for n in 0..5 {
            table.insert(&key(n), &value()).unwrap();
        }
        assert_eq!(table.flush().unwrap(), 5);
        assert!(table.is_empty().unwrap());
        assert!(backend.get("table").unwrap().is_empty());
    }

    #[test]
    fn concurrent_writers_keep_cache_and_kernel_in_step() {
        let backend = MemoryBackend::new();
        let table = AffinityTable::open(&backend, spec(1024).with_cache()).unwrap();

        std::thread::scope(|s| {
            for worker in 0..8u32 {
                let table = &table;
                s.spawn(move || {
                    for n in 0..50u32 {
                        let k = key(worker * 1000 + n);
                        table.insert(&k, &value()).unwrap();
                        if n % 2 == 0 {
                            table.delete(&k).unwrap();
                        }
                    }
                });
            }
        });

        let mut cached: Vec<_> = table.iter().unwrap().map(|(k, _)| k).collect();
        let mut kernel: Vec<_> = table.dump().unwrap().into_iter().map(|(k, _)| k).collect();
        cached.sort();
        kernel.sort();
        assert_eq!(cached.len(), 8 * 25);
        assert_eq!(cached, kernel);
        assert_eq!(table.metrics().snapshot().entries, 200);
    }
}
