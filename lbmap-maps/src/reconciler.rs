//! Keeps the affinity match map in step with the service/backend state.
//!
//! The reconciler owns the desired set of bindings. Service events update
//! it and are pushed to the map straight away; a periodic pass deletes
//! whatever the map holds beyond it and writes back what it lacks.

use crate::affinity::{AffinityMatchMap, GcReport};
use crate::retry::RetryConfig;
use lbmap_common::{
    types::{AffinityMatchKey, BackendId, RevNatId},
    Result,
};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// A change in the backends of a service. Services are identified by their
/// reverse-NAT id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    BackendAdded {
        service: RevNatId,
        backend: BackendId,
    },
    BackendRemoved {
        service: RevNatId,
        backend: BackendId,
    },
    ServiceRemoved {
        service: RevNatId,
    },
}

pub struct AffinityReconciler {
    map: Arc<AffinityMatchMap>,
    desired: RwLock<HashMap<RevNatId, BTreeSet<BackendId>>>,
    retry: RetryConfig,
}

impl AffinityReconciler {
    pub fn new(map: Arc<AffinityMatchMap>, retry: RetryConfig) -> Self {
        Self {
            map,
            desired: RwLock::new(HashMap::new()),
            retry,
        }
    }

    pub fn map(&self) -> &Arc<AffinityMatchMap> {
        &self.map
    }

    /// Apply a service event to the desired state and then to the map.
    ///
    /// The desired state is updated first, so a failed map write is repaired
    /// by the next GC pass: a missing bind is written back, a missing unbind
    /// is collected.
    pub async fn handle(&self, event: ServiceEvent) -> Result<()> {
        debug!("Affinity event: {:?}", event);
        match event {
            ServiceEvent::BackendAdded { service, backend } => {
                self.desired
                    .write()
                    .await
                    .entry(service)
                    .or_default()
                    .insert(backend);
                self.retry
                    .run("affinity bind", || self.map.bind(backend, service))
                    .await
            }
            ServiceEvent::BackendRemoved { service, backend } => {
                {
                    let mut desired = self.desired.write().await;
                    if let Some(backends) = desired.get_mut(&service) {
                        backends.remove(&backend);
                        if backends.is_empty() {
                            desired.remove(&service);
                        }
                    }
                }
                self.retry
                    .run("affinity unbind", || self.map.unbind(backend, service))
                    .await
                    .map(|_| ())
            }
            ServiceEvent::ServiceRemoved { service } => {
                let backends = self.desired.write().await.remove(&service).unwrap_or_default();
                for backend in backends {
                    let result = self
                        .retry
                        .run("affinity unbind", || self.map.unbind(backend, service))
                        .await;
                    if let Err(e) = result {
                        warn!(
                            "Failed to unbind backend {} from service {}: {}",
                            backend, service, e
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// The bindings the map should contain.
    pub async fn authoritative(&self) -> HashSet<AffinityMatchKey> {
        flatten(&*self.desired.read().await)
    }

    /// Run one garbage-collection pass: delete bindings that are not
    /// desired and write back desired bindings the table lacks.
    ///
    /// The kernel snapshot is taken before the desired state is read, and the
    /// desired state stays locked until the pass is over. A binding added in
    /// between is either absent from the snapshot or present in the desired
    /// state, and an event cannot change the desired state mid-pass, so a
    /// desired binding is never deleted.
    pub async fn gc_once(&self) -> Result<GcReport> {
        let snapshot = self.map.snapshot()?;
        let desired = self.desired.read().await;
        let authoritative = flatten(&desired);

        let present: HashSet<AffinityMatchKey> = snapshot.keys().iter().copied().collect();
        let mut missing: Vec<_> = authoritative.difference(&present).copied().collect();
        missing.sort();

        let mut report = snapshot.collect(&self.map, &authoritative);
        for key in missing {
            let result = self
                .retry
                .run("affinity bind", || self.map.bind(key.backend_id, key.rev_nat_id))
                .await;
            match result {
                Ok(()) => {
                    debug!("Restored affinity binding {}", key);
                    report.restored += 1;
                }
                Err(e) => {
                    warn!("Failed to restore affinity binding {}: {}", key, e);
                    report.failed += 1;
                }
            }
        }
        drop(desired);

        if report.restored > 0 {
            info!("Affinity map GC restored {} bindings", report.restored);
        }
        Ok(report)
    }

    /// Run GC passes every `period` until `shutdown` flips to `true`.
    pub async fn run_gc(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Starting affinity GC every {:?}", period);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.gc_once().await {
                        error!("Affinity GC pass failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Affinity GC stopped");
    }
}

fn flatten(desired: &HashMap<RevNatId, BTreeSet<BackendId>>) -> HashSet<AffinityMatchKey> {
    desired
        .iter()
        .flat_map(|(&service, backends)| {
            backends
                .iter()
                .map(move |&backend| AffinityMatchKey::new(backend, service))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use lbmap_common::types::AFFINITY_MATCH_MAP_NAME;

    const SVC: RevNatId = RevNatId(10);

    fn reconciler(backend: &MemoryBackend) -> AffinityReconciler {
        let map = Arc::new(AffinityMatchMap::open(backend, 64, true).unwrap());
        let retry = RetryConfig::new().initial_delay(Duration::from_millis(1));
        AffinityReconciler::new(map, retry)
    }

    fn added(service: RevNatId, backend: u32) -> ServiceEvent {
        ServiceEvent::BackendAdded {
            service,
            backend: BackendId(backend),
        }
    }

    #[tokio::test]
    async fn events_update_map_and_desired_state() {
        let backend = MemoryBackend::new();
        let r = reconciler(&backend);

        r.handle(added(SVC, 1)).await.unwrap();
        r.handle(added(SVC, 2)).await.unwrap();
        r.handle(ServiceEvent::BackendRemoved {
            service: SVC,
            backend: BackendId(1),
        })
        .await
        .unwrap();

        assert!(!r.map().is_bound(BackendId(1), SVC).unwrap());
        assert!(r.map().is_bound(BackendId(2), SVC).unwrap());
        let expected: HashSet<_> = [AffinityMatchKey::new(BackendId(2), SVC)].into_iter().collect();
        assert_eq!(r.authoritative().await, expected);
    }

    #[tokio::test]
    async fn service_removal_unbinds_all_backends() {
        let backend = MemoryBackend::new();
        let r = reconciler(&backend);
        for id in 1..=3 {
            r.handle(added(SVC, id)).await.unwrap();
        }
        r.handle(added(RevNatId(11), 1)).await.unwrap();

        r.handle(ServiceEvent::ServiceRemoved { service: SVC })
            .await
            .unwrap();

        assert_eq!(
            r.map().bindings().unwrap(),
            vec![AffinityMatchKey::new(BackendId(1), RevNatId(11))]
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = MemoryBackend::new();
        let r = reconciler(&backend);
        backend.get(AFFINITY_MATCH_MAP_NAME).unwrap().fail_next(2);

        r.handle(added(SVC, 1)).await.unwrap();
        assert!(r.map().is_bound(BackendId(1), SVC).unwrap());
    }

    #[tokio::test]
    async fn gc_removes_leftovers() {
        let backend = MemoryBackend::new();
        let r = reconciler(&backend);
        r.handle(added(SVC, 1)).await.unwrap();
        // left behind by a previous run
        r.map().bind(BackendId(99), SVC).unwrap();

        let report = r.gc_once().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, 1);
        assert!(r.map().is_bound(BackendId(1), SVC).unwrap());
        assert!(!r.map().is_bound(BackendId(99), SVC).unwrap());

        assert_eq!(r.gc_once().await.unwrap().removed, 0);
    }

    #[tokio::test]
    async fn gc_sees_bindings_written_by_other_handles() {
        let backend = MemoryBackend::new();
        let r = reconciler(&backend);
        r.handle(added(SVC, 1)).await.unwrap();

        let foreign = AffinityMatchMap::open(&backend, 64, false).unwrap();
        foreign.bind(BackendId(77), SVC).unwrap();

        let report = r.gc_once().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, 1);
        assert!(!foreign.is_bound(BackendId(77), SVC).unwrap());
        assert!(foreign.is_bound(BackendId(1), SVC).unwrap());
    }

    #[tokio::test]
    async fn gc_writes_back_failed_binds() {
        let backend = MemoryBackend::new();
        let map = Arc::new(AffinityMatchMap::open(&backend, 64, true).unwrap());
        let r = AffinityReconciler::new(map, RetryConfig::new().max_attempts(1));

        backend.get(AFFINITY_MATCH_MAP_NAME).unwrap().fail_next(1);
        assert!(r.handle(added(SVC, 3)).await.is_err());
        assert!(!r.map().is_bound(BackendId(3), SVC).unwrap());

        let report = r.gc_once().await.unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.removed, 0);
        assert!(r.map().is_bound(BackendId(3), SVC).unwrap());

        // nothing left to do
        assert_eq!(r.gc_once().await.unwrap(), GcReport { scanned: 1, ..GcReport::default() });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readded_backend_survives_concurrent_gc() {
        let backend = MemoryBackend::new();
        let map = Arc::new(AffinityMatchMap::open(&backend, 1024, true).unwrap());
        let retry = RetryConfig::new().initial_delay(Duration::from_millis(1));
        let r = Arc::new(AffinityReconciler::new(map, retry));

        for id in 0..200 {
            // left over from a previous run, then added again
            r.map().bind(BackendId(id), SVC).unwrap();

            let gc = tokio::spawn({
                let r = Arc::clone(&r);
                async move { r.gc_once().await }
            });
            let add = tokio::spawn({
                let r = Arc::clone(&r);
                async move { r.handle(added(SVC, id)).await }
            });
            gc.await.unwrap().unwrap();
            add.await.unwrap().unwrap();

            assert!(
                r.map().is_bound(BackendId(id), SVC).unwrap(),
                "backend {} lost its binding",
                id
            );
        }
        assert_eq!(r.map().len().unwrap(), 200);
    }

    #[tokio::test]
    async fn gc_loop_stops_on_shutdown() {
        let backend = MemoryBackend::new();
        let r = Arc::new(reconciler(&backend));
        r.map().bind(BackendId(5), SVC).unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(r.clone().run_gc(Duration::from_millis(5), rx));

        // the first tick fires immediately
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert!(r.map().is_empty().unwrap());
    }
}
