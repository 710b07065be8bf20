//! The capability to issue map syscalls.
//!
//! A [`MapBackend`] opens tables by identity; the resulting [`RawMap`] is the
//! only thing allowed to move bytes in and out of the kernel. Keys and values
//! cross this boundary as borrowed byte slices that live for the duration of
//! a single call.

use lbmap_common::{Error, Record, RecordLayout, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Kernel map type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MapKind {
    Hash,
    LruHash,
    Array,
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKind::Hash => write!(f, "hash"),
            MapKind::LruHash => write!(f, "lru_hash"),
            MapKind::Array => write!(f, "array"),
        }
    }
}

/// Flags for a single-record update, mirroring `BPF_ANY`, `BPF_NOEXIST`
/// and `BPF_EXIST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlags {
    Any,
    NoExist,
    Exist,
}

impl UpdateFlags {
    pub fn bits(self) -> u64 {
        match self {
            UpdateFlags::Any => 0,
            UpdateFlags::NoExist => 1,
            UpdateFlags::Exist => 2,
        }
    }
}

/// Identity of a kernel-shared table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapSpec {
    pub name: String,
    pub kind: MapKind,
    pub key: &'static RecordLayout,
    pub value: &'static RecordLayout,
    pub max_entries: u32,
    /// Mirror the table contents in process memory.
    pub cache: bool,
}

impl MapSpec {
    /// Identity for a table keyed by `K` holding `V`. Caching is off until
    /// [`MapSpec::with_cache`] is called.
    pub fn new<K: Record, V: Record>(name: impl Into<String>, kind: MapKind, max_entries: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            key: K::layout(),
            value: V::layout(),
            max_entries,
            cache: false,
        }
    }

    pub fn with_cache(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.key.validate()?;
        self.value.validate()?;
        if self.max_entries == 0 {
            return Err(self.incompatible("max_entries must be non-zero".into()));
        }
        if self.kind == MapKind::Array && self.key.size != 4 {
            return Err(self.incompatible(format!(
                "array maps need a 4 byte key, {} is {} bytes",
                self.key.name, self.key.size
            )));
        }
        Ok(())
    }

    /// Compare this identity with one already present in the kernel.
    /// Only the layouts, the capacity and the kind matter; the cache flag is
    /// a property of the handle, not of the table.
    pub fn check_compatible(&self, existing: &MapSpec) -> Result<()> {
        if self.kind != existing.kind {
            return Err(self.incompatible(format!(
                "map kind {} != existing {}",
                self.kind, existing.kind
            )));
        }
        if !self.key.is_compatible_with(existing.key) {
            return Err(self.incompatible(format!(
                "key layout {} != existing {}",
                self.key, existing.key
            )));
        }
        if !self.value.is_compatible_with(existing.value) {
            return Err(self.incompatible(format!(
                "value layout {} != existing {}",
                self.value, existing.value
            )));
        }
        if self.max_entries != existing.max_entries {
            return Err(self.incompatible(format!(
                "max_entries {} != existing {}",
                self.max_entries, existing.max_entries
            )));
        }
        Ok(())
    }

    pub(crate) fn incompatible(&self, reason: String) -> Error {
        Error::IncompatibleLayout {
            map: self.name.clone(),
            reason,
        }
    }

    pub(crate) fn full(&self) -> Error {
        Error::CapacityExceeded {
            map: self.name.clone(),
            max_entries: self.max_entries,
        }
    }
}

/// Byte-level operations on one open kernel table.
///
/// Every call is a single bounded syscall (or the in-memory equivalent) and
/// is atomic for the one record it touches. Nothing is atomic across records.
pub trait RawMap: Send + Sync {
    fn name(&self) -> &str;

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Fails with `CapacityExceeded` when inserting a new key into a full
    /// table and with `KeyExists` for a `NoExist` update of a present key.
    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<()>;

    /// Returns `false` when the key was not present.
    fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Point-in-time copy of every record in the table.
    fn dump(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn count(&self) -> Result<usize> {
        Ok(self.dump()?.len())
    }
}

/// Opens kernel tables by identity.
pub trait MapBackend: Send + Sync {
    /// Open the named table, creating it if it does not exist yet. Opening
    /// an existing table succeeds only if its identity is compatible.
    fn open_or_create<K: Record, V: Record>(&self, spec: &MapSpec) -> Result<Arc<dyn RawMap>>;

    /// Remove the table identity. The kernel object goes away once the last
    /// user lets go of it.
    fn destroy(&self, name: &str) -> Result<()>;
}

impl<B: MapBackend> MapBackend for Arc<B> {
    fn open_or_create<K: Record, V: Record>(&self, spec: &MapSpec) -> Result<Arc<dyn RawMap>> {
        (**self).open_or_create::<K, V>(spec)
    }

    fn destroy(&self, name: &str) -> Result<()> {
        (**self).destroy(name)
    }
}
