//! Unit tests for the affinity match map

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::backend::RawMap;
    use crate::memory::MemoryBackend;
    use lbmap_common::Error;

    const SVC: RevNatId = RevNatId(100);

    fn open(backend: &MemoryBackend) -> AffinityMatchMap {
        AffinityMatchMap::open(backend, 64, true).unwrap()
    }

    fn binding(backend_id: u32, rev_nat_id: RevNatId) -> AffinityMatchKey {
        AffinityMatchKey::new(BackendId(backend_id), rev_nat_id)
    }

    #[test]
    fn test_bind_and_unbind() {
        let backend = MemoryBackend::new();
        let map = open(&backend);

        map.bind(BackendId(1), SVC).unwrap();
        assert!(map.is_bound(BackendId(1), SVC).unwrap());
        assert!(!map.is_bound(BackendId(1), RevNatId(101)).unwrap());

        assert!(map.unbind(BackendId(1), SVC).unwrap());
        assert!(!map.is_bound(BackendId(1), SVC).unwrap());

        // absent key is reported, not raised
        assert!(!map.unbind(BackendId(1), SVC).unwrap());
    }

    #[test]
    fn test_bind_is_idempotent() {
        let backend = MemoryBackend::new();
        let map = open(&backend);

        map.bind(BackendId(7), SVC).unwrap();
        map.bind(BackendId(7), SVC).unwrap();

        assert_eq!(map.len().unwrap(), 1);
        assert_eq!(backend.get(AFFINITY_MATCH_MAP_NAME).unwrap().len(), 1);
    }

    #[test]
    fn test_kernel_record_uses_network_order_rev_nat() {
        let backend = MemoryBackend::new();
        let map = open(&backend);
        map.bind(BackendId(5), RevNatId(0x0102)).unwrap();

        let raw = backend.get(AFFINITY_MATCH_MAP_NAME).unwrap().dump().unwrap();
        assert_eq!(raw.len(), 1);
        let (key, value) = &raw[0];
        assert_eq!(&key[0..4], &5u32.to_ne_bytes());
        assert_eq!(&key[4..6], &[0x01, 0x02]);
        assert_eq!(&key[6..8], &[0, 0]);
        assert_eq!(value, &vec![0u8]);
    }

    #[test]
    fn test_reconcile_removes_stale_bindings() {
        let backend = MemoryBackend::new();
        let map = open(&backend);
        for id in 1..=3 {
            map.bind(BackendId(id), SVC).unwrap();
        }

        let authoritative: HashSet<_> = [binding(1, SVC), binding(3, SVC)].into_iter().collect();
        let report = map.reconcile(&authoritative).unwrap();

        assert_eq!(
            report,
            GcReport {
                scanned: 3,
                removed: 1,
                restored: 0,
                failed: 0
            }
        );
        assert!(map.is_bound(BackendId(1), SVC).unwrap());
        assert!(!map.is_bound(BackendId(2), SVC).unwrap());
        assert!(map.is_bound(BackendId(3), SVC).unwrap());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let backend = MemoryBackend::new();
        let map = open(&backend);
        for id in 1..=3 {
            map.bind(BackendId(id), SVC).unwrap();
        }
        map.bind(BackendId(9), RevNatId(200)).unwrap();

        let authoritative: HashSet<_> = [binding(2, SVC)].into_iter().collect();
        assert_eq!(map.reconcile(&authoritative).unwrap().removed, 3);

        let second = map.reconcile(&authoritative).unwrap();
        assert_eq!(second.removed, 0);
        assert_eq!(second.scanned, 1);
        assert_eq!(map.bindings().unwrap(), vec![binding(2, SVC)]);
    }

    #[test]
    fn test_bind_after_snapshot_survives_the_pass() {
        let backend = MemoryBackend::new();
        let map = open(&backend);
        for id in 1..=3 {
            map.bind(BackendId(id), SVC).unwrap();
        }
        let authoritative: HashSet<_> = [binding(1, SVC), binding(3, SVC)].into_iter().collect();

        let snapshot = map.snapshot().unwrap();
        map.bind(BackendId(4), SVC).unwrap();
        let report = snapshot.collect(&map, &authoritative);

        assert_eq!(report.removed, 1);
        assert!(map.is_bound(BackendId(4), SVC).unwrap());
        assert!(!map.is_bound(BackendId(2), SVC).unwrap());
    }

    #[test]
    fn test_reconcile_concurrent_with_binds() {
        let backend = MemoryBackend::new();
        let map = AffinityMatchMap::open(&backend, 256, true).unwrap();
        for id in 0..20 {
            map.bind(BackendId(id), SVC).unwrap();
        }
        // nothing in the authoritative set: only the initial entries are fair game
        let authoritative = HashSet::new();
        let snapshot = map.snapshot().unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for id in 100..150 {
                    map.bind(BackendId(id), SVC).unwrap();
                }
            });
            s.spawn(|| {
                snapshot.collect(&map, &authoritative);
            });
        });

        let mut left: Vec<_> = map.bindings().unwrap().into_iter().map(|k| k.backend_id.0).collect();
        left.sort();
        assert_eq!(left, (100u32..150).collect::<Vec<_>>());
    }

    #[test]
    fn test_reconcile_continues_past_failures() {
        let backend = MemoryBackend::new();
        let map = open(&backend);
        for id in 1..=3 {
            map.bind(BackendId(id), SVC).unwrap();
        }

        let snapshot = map.snapshot().unwrap();
        backend.get(AFFINITY_MATCH_MAP_NAME).unwrap().fail_next(1);
        let report = snapshot.collect(&map, &HashSet::new());

        assert_eq!(report.scanned, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(map.len().unwrap(), 1);

        // the next pass picks up what the failed one left behind
        let report = map.reconcile(&HashSet::new()).unwrap();
        assert_eq!(report.removed, 1);
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn test_capacity_exceeded() {
        let backend = MemoryBackend::new();
        let map = AffinityMatchMap::open(&backend, 2, true).unwrap();
        map.bind(BackendId(1), SVC).unwrap();
        map.bind(BackendId(2), SVC).unwrap();

        assert!(matches!(
            map.bind(BackendId(3), SVC),
            Err(Error::CapacityExceeded { max_entries: 2, .. })
        ));
        assert!(!map.is_bound(BackendId(3), SVC).unwrap());
        // rebinding an existing pair still works on a full map
        map.bind(BackendId(2), SVC).unwrap();
    }

    #[test]
    fn test_reopen_keeps_existing_bindings() {
        let backend = MemoryBackend::new();
        {
            let map = open(&backend);
            map.bind(BackendId(1), SVC).unwrap();
        }

        let map = open(&backend);
        assert!(map.is_bound(BackendId(1), SVC).unwrap());
        assert_eq!(map.bindings().unwrap(), vec![binding(1, SVC)]);

        assert!(matches!(
            AffinityMatchMap::open(&backend, 128, true),
            Err(Error::IncompatibleLayout { .. })
        ));
    }

    #[test]
    fn test_stale_foreign_entry_is_collected() {
        let backend = MemoryBackend::new();
        let map = open(&backend);
        let foreign = AffinityMatchMap::open(&backend, 64, false).unwrap();
        foreign.bind(BackendId(8), SVC).unwrap();

        // the cache does not know about it, the GC pass still does
        assert_eq!(map.len().unwrap(), 0);
        assert_eq!(map.reconcile(&HashSet::new()).unwrap().removed, 1);
        assert!(!foreign.is_bound(BackendId(8), SVC).unwrap());
        assert_eq!(map.resync().unwrap(), 0);
    }

    #[test]
    fn test_flush_and_stats() {
        let backend = MemoryBackend::new();
        let map = open(&backend);
        map.bind(BackendId(1), SVC).unwrap();
        map.bind(BackendId(2), SVC).unwrap();
        map.is_bound(BackendId(1), SVC).unwrap();

        assert_eq!(map.flush().unwrap(), 2);
        assert!(map.is_empty().unwrap());

        let stats = map.stats();
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.deletes, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_gc_report_display() {
        let report = GcReport {
            scanned: 3,
            removed: 1,
            restored: 2,
            failed: 0,
        };
        assert_eq!(
            report.to_string(),
            "scanned 3 entries, removed 1, restored 2, failed 0"
        );
    }
}
