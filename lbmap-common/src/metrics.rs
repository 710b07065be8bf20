//! In-process counters for kernel-shared tables.
//!
//! Every table handle owns a [`TableMetrics`]; tooling reads a consistent
//! [`TableStats`] copy of it.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/* ---------------------------------------------------------------- *
 * Simple Counter
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/* ---------------------------------------------------------------- *
 * Gauge
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn decrement(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/* ---------------------------------------------------------------- *
 * Per-table metrics
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct TableMetrics {
    pub lookups: Counter,
    pub cache_hits: Counter,
    pub inserts: Counter,
    pub deletes: Counter,
    pub errors: Counter,
    /// Raw records skipped because they did not decode.
    pub malformed: Counter,
    /// Entries currently in the cache (only maintained for cached tables).
    pub entries: Gauge,
}

impl TableMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TableStats {
        TableStats {
            lookups: self.lookups.value(),
            cache_hits: self.cache_hits.value(),
            inserts: self.inserts.value(),
            deletes: self.deletes.value(),
            errors: self.errors.value(),
            malformed: self.malformed.value(),
            entries: self.entries.value(),
        }
    }
}

/// Point-in-time copy of [`TableMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub lookups: u64,
    pub cache_hits: u64,
    pub inserts: u64,
    pub deletes: u64,
    pub errors: u64,
    pub malformed: u64,
    pub entries: u64,
}

impl TableStats {
    pub fn cache_hit_ratio(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.lookups as f64
        }
    }
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entries={} lookups={} cache_hits={} inserts={} deletes={} errors={} malformed={}",
            self.entries,
            self.lookups,
            self.cache_hits,
            self.inserts,
            self.deletes,
            self.errors,
            self.malformed
        )
    }
}
