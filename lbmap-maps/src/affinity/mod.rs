//! Session-affinity match map.
//!
//! The datapath consults this map to decide whether a backend remembered
//! for a client is still part of the service's active set. An entry
//! `(backend_id, rev_nat_id)` means "backend is active for this service";
//! the value carries no data.

use crate::backend::{MapBackend, MapKind, MapSpec};
use crate::table::Table;
use lbmap_common::{
    metrics::TableStats,
    types::{AffinityMatchKey, AffinityMatchValue, BackendId, RevNatId, AFFINITY_MATCH_MAP_NAME},
    Result,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

mod tests;

/// Wrapper around the affinity match table.
pub struct AffinityMatchMap {
    table: Table<AffinityMatchKey, AffinityMatchValue>,
}

impl AffinityMatchMap {
    /// Identity of the affinity match map.
    pub fn spec(max_entries: u32, cache: bool) -> MapSpec {
        let spec = MapSpec::new::<AffinityMatchKey, AffinityMatchValue>(
            AFFINITY_MATCH_MAP_NAME,
            MapKind::Hash,
            max_entries,
        );
        if cache {
            spec.with_cache()
        } else {
            spec
        }
    }

    /// Open or create the affinity match map.
    pub fn open<B: MapBackend>(backend: &B, max_entries: u32, cache: bool) -> Result<Self> {
        Self::open_with_spec(backend, Self::spec(max_entries, cache))
    }

    /// Open the map under a non-default identity, e.g. a differently named
    /// copy used while migrating.
    pub fn open_with_spec<B: MapBackend>(backend: &B, spec: MapSpec) -> Result<Self> {
        Ok(Self {
            table: Table::open(backend, spec)?,
        })
    }

    /// Mark `backend_id` as active for the service `rev_nat_id`. Binding an
    /// already bound pair leaves a single entry.
    pub fn bind(&self, backend_id: BackendId, rev_nat_id: RevNatId) -> Result<()> {
        let key = AffinityMatchKey::new(backend_id, rev_nat_id);
        self.table.insert(&key, &AffinityMatchValue::new())
    }

    /// Remove the binding. Returns `false` if it did not exist.
    pub fn unbind(&self, backend_id: BackendId, rev_nat_id: RevNatId) -> Result<bool> {
        let key = AffinityMatchKey::new(backend_id, rev_nat_id);
        let removed = self.table.delete(&key)?;
        if !removed {
            debug!("Affinity binding {} was already gone", key);
        }
        Ok(removed)
    }

    pub fn is_bound(&self, backend_id: BackendId, rev_nat_id: RevNatId) -> Result<bool> {
        let key = AffinityMatchKey::new(backend_id, rev_nat_id);
        Ok(self.table.lookup(&key)?.is_some())
    }

    /// All current bindings.
    pub fn bindings(&self) -> Result<Vec<AffinityMatchKey>> {
        Ok(self.table.iter()?.map(|(key, _)| key).collect())
    }

    /// Take the point-in-time view a garbage-collection pass works on. It is
    /// read from the kernel table, so bindings written by other processes
    /// are candidates too.
    pub fn snapshot(&self) -> Result<GcSnapshot> {
        Ok(GcSnapshot {
            keys: self.table.dump()?.into_iter().map(|(key, _)| key).collect(),
        })
    }

    /// Delete every binding that is not in `authoritative`.
    ///
    /// Only entries present when the pass starts are candidates, so a bind
    /// racing with the pass is never removed by it. Running the pass twice
    /// with the same set removes nothing the second time.
    pub fn reconcile(&self, authoritative: &HashSet<AffinityMatchKey>) -> Result<GcReport> {
        Ok(self.snapshot()?.collect(self, authoritative))
    }

    pub fn len(&self) -> Result<usize> {
        self.table.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.table.is_empty()
    }

    /// Remove every binding.
    pub fn flush(&self) -> Result<usize> {
        self.table.flush()
    }

    /// Re-read the kernel table into the cache.
    pub fn resync(&self) -> Result<usize> {
        self.table.resync()
    }

    pub fn stats(&self) -> TableStats {
        self.table.metrics().snapshot()
    }

    pub fn table(&self) -> &Table<AffinityMatchKey, AffinityMatchValue> {
        &self.table
    }
}

/// The bindings a garbage-collection pass may remove.
#[derive(Debug, Clone)]
pub struct GcSnapshot {
    keys: Vec<AffinityMatchKey>,
}

impl GcSnapshot {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[AffinityMatchKey] {
        &self.keys
    }

    /// Remove the stale entries of this snapshot from `map`. A failure on one
    /// entry is logged and counted; the pass carries on with the rest.
    pub fn collect(
        self,
        map: &AffinityMatchMap,
        authoritative: &HashSet<AffinityMatchKey>,
    ) -> GcReport {
        let mut report = GcReport {
            scanned: self.keys.len(),
            ..GcReport::default()
        };

        for key in self.keys {
            if authoritative.contains(&key) {
                continue;
            }
            match map.table.delete(&key) {
                Ok(true) => {
                    debug!("Removed stale affinity binding {}", key);
                    report.removed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to remove stale affinity binding {}: {}", key, e);
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 || report.failed > 0 {
            info!("Affinity map GC: {}", report);
        }
        report
    }
}

/// Outcome of one garbage-collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub scanned: usize,
    pub removed: usize,
    /// Desired bindings missing from the table and written back.
    pub restored: usize,
    pub failed: usize,
}

impl fmt::Display for GcReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {} entries, removed {}, restored {}, failed {}",
            self.scanned, self.removed, self.restored, self.failed
        )
    }
}
