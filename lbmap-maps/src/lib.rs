//! Userspace side of the load-balancer maps
//!
//! This crate opens the tables shared with the in-kernel load balancer,
//! keeps an optional in-process copy of them, and maintains the
//! session-affinity match map on behalf of the service controller.

use lbmap_common::{metrics::TableStats, Result};
use log::info;
use std::sync::Arc;

pub mod affinity;
pub mod backend;
mod cache;
pub mod config;
pub mod loader;
pub mod memory;
pub mod reconciler;
pub mod retry;
pub mod table;

pub use affinity::{AffinityMatchMap, GcReport, GcSnapshot};
pub use backend::{MapBackend, MapKind, MapSpec, RawMap, UpdateFlags};
pub use config::LbMapConfig;
pub use loader::{PinnedBackend, DEFAULT_PIN_ROOT};
pub use memory::MemoryBackend;
pub use reconciler::{AffinityReconciler, ServiceEvent};
pub use retry::RetryConfig;
pub use table::Table;

/// What to do with the kernel tables when a registry is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Leave the tables pinned for the datapath and the next run
    Keep,
    /// Remove the tables
    Destroy,
}

/// The set of tables the control plane owns.
pub struct MapRegistry<B: MapBackend> {
    backend: B,
    affinity: Arc<AffinityMatchMap>,
}

impl<B: MapBackend> MapRegistry<B> {
    /// Open every table on `backend`.
    pub fn open(backend: B, config: &LbMapConfig) -> Result<Self> {
        config.validate()?;
        let affinity = Arc::new(AffinityMatchMap::open(
            &backend,
            config.affinity_max_entries,
            config.cache,
        )?);
        info!(
            "Opened affinity map ({} bindings, capacity {})",
            affinity.len()?,
            config.affinity_max_entries
        );

        Ok(Self { backend, affinity })
    }

    pub fn affinity(&self) -> Arc<AffinityMatchMap> {
        Arc::clone(&self.affinity)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Counters of every table, by name.
    pub fn stats(&self) -> Vec<(String, TableStats)> {
        vec![(self.affinity.table().name().to_string(), self.affinity.stats())]
    }

    pub fn close(self, teardown: Teardown) -> Result<()> {
        let name = self.affinity.table().name().to_string();
        drop(self.affinity);
        if teardown == Teardown::Destroy {
            self.backend.destroy(&name)?;
            info!("Destroyed map {}", name);
        }
        Ok(())
    }
}

impl MapRegistry<PinnedBackend> {
    /// Open the pinned kernel tables described by `config`. Missing tables
    /// can only be created when `config.object_path` names the datapath
    /// object.
    pub fn pinned(config: &LbMapConfig) -> Result<Self> {
        let backend = match &config.object_path {
            Some(path) => PinnedBackend::load(config.pin_root.clone(), path)?,
            None => PinnedBackend::new(config.pin_root.clone()),
        };
        Self::open(backend, config)
    }
}
