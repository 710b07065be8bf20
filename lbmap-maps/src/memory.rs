//! In-process stand-in for kernel tables.
//!
//! Behaves like the kernel primitives as far as this crate can observe:
//! fixed record sizes, capacity limits, create-only and update-only flags,
//! LRU eviction and pre-populated arrays. Used by tests and dry runs, and
//! shared between handles the same way a pinned kernel map is.

use crate::backend::{MapBackend, MapKind, MapSpec, RawMap, UpdateFlags};
use lbmap_common::{Error, Record, Result};
use log::debug;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Registry of in-memory tables keyed by name.
#[derive(Default)]
pub struct MemoryBackend {
    maps: Mutex<HashMap<String, Arc<MemoryMap>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to a table, bypassing any handle.
    pub fn get(&self, name: &str) -> Option<Arc<MemoryMap>> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryMap>>> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MapBackend for MemoryBackend {
    fn open_or_create<K: Record, V: Record>(&self, spec: &MapSpec) -> Result<Arc<dyn RawMap>> {
        spec.validate()?;

        let mut maps = self.lock();
        if let Some(existing) = maps.get(&spec.name) {
            spec.check_compatible(&existing.spec)?;
            debug!("Reusing in-memory map {}", spec.name);
            return Ok(existing.clone());
        }

        debug!("Creating in-memory map {} ({})", spec.name, spec.kind);
        let map = Arc::new(MemoryMap::new(spec.clone()));
        maps.insert(spec.name.clone(), Arc::clone(&map));
        Ok(map)
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.lock().remove(name);
        Ok(())
    }
}

struct Slot {
    value: Vec<u8>,
    last_used: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<Vec<u8>, Slot>,
    clock: u64,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// One in-memory table.
pub struct MemoryMap {
    spec: MapSpec,
    state: Mutex<State>,
    pending_failures: AtomicU32,
}

impl MemoryMap {
    fn new(spec: MapSpec) -> Self {
        let mut state = State::default();
        if spec.kind == MapKind::Array {
            let zero = vec![0u8; spec.value.size];
            for index in 0..spec.max_entries {
                state.entries.insert(
                    index.to_ne_bytes().to_vec(),
                    Slot {
                        value: zero.clone(),
                        last_used: 0,
                    },
                );
            }
        }
        Self {
            spec,
            state: Mutex::new(state),
            pending_failures: AtomicU32::new(0),
        }
    }

    pub fn spec(&self) -> &MapSpec {
        &self.spec
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a record without any size checks, the way a misbehaving
    /// foreign writer could.
    pub fn inject_raw(&self, key: Vec<u8>, value: Vec<u8>) {
        let mut state = self.lock();
        let last_used = state.tick();
        state.entries.insert(key, Slot { value, last_used });
    }

    /// Make the next `count` operations fail with EAGAIN.
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected_failure(&self, call: &'static str) -> Result<()> {
        let failed = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Transient {
                map: self.spec.name.clone(),
                call,
                source: io::Error::from_raw_os_error(libc::EAGAIN),
            });
        }
        Ok(())
    }

    fn syscall_error(&self, call: &'static str, errno: i32) -> Error {
        Error::Syscall {
            map: self.spec.name.clone(),
            call,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    fn evict_lru(&self, state: &mut State) {
        let victim = state
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            state.entries.remove(&key);
        }
    }
}

impl RawMap for MemoryMap {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.injected_failure("bpf_map_lookup_elem")?;
        self.spec.key.check_len(key.len())?;

        let mut state = self.lock();
        let now = state.tick();
        Ok(state.entries.get_mut(key).map(|slot| {
            slot.last_used = now;
            slot.value.clone()
        }))
    }

    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<()> {
        self.injected_failure("bpf_map_update_elem")?;
        self.spec.key.check_len(key.len())?;
        self.spec.value.check_len(value.len())?;

        let mut state = self.lock();
        let present = state.entries.contains_key(key);
        match (flags, present) {
            (UpdateFlags::NoExist, true) => {
                return Err(Error::KeyExists {
                    map: self.spec.name.clone(),
                })
            }
            (UpdateFlags::Exist, false) => {
                return Err(self.syscall_error("bpf_map_update_elem", libc::ENOENT))
            }
            _ => {}
        }

        if !present && state.entries.len() >= self.spec.max_entries as usize {
            match self.spec.kind {
                MapKind::LruHash => self.evict_lru(&mut state),
                MapKind::Hash | MapKind::Array => return Err(self.spec.full()),
            }
        }

        let last_used = state.tick();
        state.entries.insert(
            key.to_vec(),
            Slot {
                value: value.to_vec(),
                last_used,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        self.injected_failure("bpf_map_delete_elem")?;
        if self.spec.kind == MapKind::Array {
            return Err(self.syscall_error("bpf_map_delete_elem", libc::EINVAL));
        }
        self.spec.key.check_len(key.len())?;
        Ok(self.lock().entries.remove(key).is_some())
    }

    fn dump(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.injected_failure("bpf_map_get_next_key")?;
        Ok(self
            .lock()
            .entries
            .iter()
            .map(|(key, slot)| (key.clone(), slot.value.clone()))
            .collect())
    }

    fn count(&self) -> Result<usize> {
        self.injected_failure("bpf_map_get_next_key")?;
        Ok(self.len())
    }
}
