//! Kernel tables backed by pinned BPF maps.
//!
//! The datapath object declares its maps; loading it with a pin path makes
//! the kernel reuse maps already pinned there and create the rest. A table
//! is then always reached through its pin, which is what lets a restarted
//! control plane pick up the same kernel table.

use crate::backend::{MapBackend, MapKind, MapSpec, RawMap, UpdateFlags};
use aya::{
    maps::{HashMap, Map, MapData, MapError, MapType},
    pin::PinError,
    Ebpf, EbpfLoader,
};
use aya_log::EbpfLogger;
use lbmap_common::{layout::to_raw, Error, Record, Result};
use log::{debug, info, warn};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

/// Where tc-attached datapath programs expect their global maps.
pub const DEFAULT_PIN_ROOT: &str = "/sys/fs/bpf/tc/globals";

/// Load an eBPF object file, reusing any of its maps already pinned under
/// `pin_root`.
pub fn load_bpf_object<P: AsRef<Path>>(path: P, pin_root: &Path) -> Result<Ebpf> {
    let path = path.as_ref();

    debug!("Loading BPF object file: {}", path.display());

    let bpf = EbpfLoader::new()
        .map_pin_path(pin_root)
        .load_file(path)
        .map_err(|e| Error::Ebpf(format!("failed to load {}: {}", path.display(), e)))?;

    info!("Successfully loaded BPF object file: {}", path.display());

    Ok(bpf)
}

/// Opens tables through their pins under one directory.
pub struct PinnedBackend {
    pin_root: PathBuf,
    object: Mutex<Option<Ebpf>>,
}

impl PinnedBackend {
    /// Backend that can only open maps which are already pinned.
    pub fn new<P: Into<PathBuf>>(pin_root: P) -> Self {
        Self {
            pin_root: pin_root.into(),
            object: Mutex::new(None),
        }
    }

    /// Backend that creates missing maps from the definitions in `object`.
    pub fn with_object<P: Into<PathBuf>>(pin_root: P, object: Ebpf) -> Self {
        Self {
            pin_root: pin_root.into(),
            object: Mutex::new(Some(object)),
        }
    }

    /// Load the datapath object from `path` and use it to create maps.
    pub fn load<P: Into<PathBuf>, O: AsRef<Path>>(pin_root: P, path: O) -> Result<Self> {
        let pin_root = pin_root.into();
        let mut bpf = load_bpf_object(path, &pin_root)?;

        // Initialize logging for the BPF program
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize BPF logger: {}", e);
        }

        Ok(Self::with_object(pin_root, bpf))
    }

    pub fn pin_root(&self) -> &Path {
        &self.pin_root
    }

    pub fn pin_path(&self, name: &str) -> PathBuf {
        self.pin_root.join(name)
    }

    /// Make sure the map is pinned, then open it through the pin.
    fn materialize(&self, spec: &MapSpec) -> Result<MapData> {
        let path = self.pin_path(&spec.name);

        if !path.exists() {
            let mut object = self.object.lock().unwrap_or_else(PoisonError::into_inner);
            let bpf = object.as_mut().ok_or_else(|| {
                Error::Ebpf(format!(
                    "map {} is not pinned at {} and no object was loaded",
                    spec.name,
                    path.display()
                ))
            })?;
            pin_map(bpf, &spec.name, &path)?;
            info!("Pinned map {} at {}", spec.name, path.display());
        }

        MapData::from_pin(&path).map_err(|e| {
            Error::Ebpf(format!(
                "failed to open pinned map {}: {}",
                path.display(),
                e
            ))
        })
    }
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let map = bpf
        .map_mut(map_name)
        .ok_or_else(|| Error::Ebpf(format!("map {map_name} not found in object")))?;
    match map.pin(path) {
        Ok(()) => Ok(()),
        Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            Ok(())
        }
        Err(err) => Err(Error::Ebpf(format!(
            "failed to pin map {map_name} at {}: {err}",
            path.display()
        ))),
    }
}

/// Compare the kernel's view of a map with the requested identity.
fn check_info(spec: &MapSpec, data: &MapData) -> Result<()> {
    let info = data
        .info()
        .map_err(|e| Error::Ebpf(format!("failed to query map {}: {}", spec.name, e)))?;

    let kind = match info.map_type() {
        Ok(MapType::Hash) => MapKind::Hash,
        Ok(MapType::LruHash) => MapKind::LruHash,
        Ok(MapType::Array) => MapKind::Array,
        Ok(other) => {
            return Err(spec.incompatible(format!("unsupported map type {:?}", other)));
        }
        Err(e) => return Err(spec.incompatible(e.to_string())),
    };

    let mismatch = if kind != spec.kind {
        Some(format!("map kind {} != existing {}", spec.kind, kind))
    } else if info.key_size() as usize != spec.key.size {
        Some(format!(
            "key size {} != existing {}",
            spec.key.size,
            info.key_size()
        ))
    } else if info.value_size() as usize != spec.value.size {
        Some(format!(
            "value size {} != existing {}",
            spec.value.size,
            info.value_size()
        ))
    } else if info.max_entries() != spec.max_entries {
        Some(format!(
            "max_entries {} != existing {}",
            spec.max_entries,
            info.max_entries()
        ))
    } else {
        None
    };

    match mismatch {
        Some(reason) => Err(spec.incompatible(reason)),
        None => Ok(()),
    }
}

impl MapBackend for PinnedBackend {
    fn open_or_create<K: Record, V: Record>(&self, spec: &MapSpec) -> Result<Arc<dyn RawMap>> {
        spec.validate()?;
        if spec.kind == MapKind::Array {
            return Err(spec.incompatible("array maps are not supported on pinned tables".into()));
        }
        if std::mem::size_of::<K::Raw>() != spec.key.size
            || std::mem::size_of::<V::Raw>() != spec.value.size
        {
            return Err(spec.incompatible("raw buffer size differs from the layout".into()));
        }

        let data = self.materialize(spec)?;
        check_info(spec, &data)?;

        let map = match spec.kind {
            MapKind::LruHash => Map::LruHashMap(data),
            _ => Map::HashMap(data),
        };
        let map = HashMap::<MapData, K::Raw, V::Raw>::try_from(map)
            .map_err(|e| spec.incompatible(e.to_string()))?;

        Ok(Arc::new(PinnedMap::<K, V> {
            spec: spec.clone(),
            map: RwLock::new(map),
        }))
    }

    fn destroy(&self, name: &str) -> Result<()> {
        let path = self.pin_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Unpinned map {} from {}", name, path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One pinned hash or LRU hash map.
///
/// aya needs exclusive access to update a map, so writes take the lock
/// exclusively while lookups and dumps share it.
struct PinnedMap<K: Record, V: Record> {
    spec: MapSpec,
    map: RwLock<HashMap<MapData, K::Raw, V::Raw>>,
}

impl<K: Record, V: Record> PinnedMap<K, V> {
    fn syscall_error(&self, err: MapError) -> Error {
        match err {
            MapError::SyscallError(err) => {
                let name = self.spec.name.clone();
                match err.io_error.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::EINTR) => {
                        Error::Transient {
                            map: name,
                            call: err.call,
                            source: err.io_error,
                        }
                    }
                    Some(libc::E2BIG) => self.spec.full(),
                    Some(libc::EEXIST) => Error::KeyExists { map: name },
                    _ => Error::Syscall {
                        map: name,
                        call: err.call,
                        source: err.io_error,
                    },
                }
            }
            other => Error::Syscall {
                map: self.spec.name.clone(),
                call: "bpf",
                source: io::Error::new(io::ErrorKind::Other, other.to_string()),
            },
        }
    }
}

impl<K: Record, V: Record> RawMap for PinnedMap<K, V> {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = to_raw::<K>(key)?;
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        match map.get(&key, 0) {
            Ok(value) => Ok(Some(value.as_ref().to_vec())),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(self.syscall_error(e)),
        }
    }

    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<()> {
        let key = to_raw::<K>(key)?;
        let value = to_raw::<V>(value)?;
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key, value, flags.bits())
            .map_err(|e| self.syscall_error(e))
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let key = to_raw::<K>(key)?;
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        match map.remove(&key) {
            Ok(()) => Ok(true),
            Err(MapError::KeyNotFound) => Ok(false),
            Err(MapError::SyscallError(err)) if err.io_error.raw_os_error() == Some(libc::ENOENT) => {
                Ok(false)
            }
            Err(e) => Err(self.syscall_error(e)),
        }
    }

    fn dump(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        let mut records = Vec::new();
        for item in map.iter() {
            match item {
                Ok((key, value)) => records.push((key.as_ref().to_vec(), value.as_ref().to_vec())),
                // deleted while we were walking the keys
                Err(MapError::KeyNotFound) => continue,
                Err(e) => return Err(self.syscall_error(e)),
            }
        }
        Ok(records)
    }
}
