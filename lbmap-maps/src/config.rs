//! Configuration for the load-balancer maps.
//!
//! Values come from the built-in defaults, then an optional TOML file, then
//! `LBMAP_*` environment variables (e.g. `LBMAP_GC_INTERVAL_SECS=10`).

use crate::loader::DEFAULT_PIN_ROOT;
use crate::retry::RetryConfig;
use lbmap_common::{types::MAX_ENTRIES, Error, Result};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Map layer configuration options
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LbMapConfig {
    /// Directory the maps are pinned under
    pub pin_root: PathBuf,

    /// Datapath object declaring the maps; needed only to create them
    pub object_path: Option<PathBuf>,

    /// Capacity of the affinity match map
    pub affinity_max_entries: u32,

    /// Keep an in-process copy of the maps
    pub cache: bool,

    /// Seconds between affinity garbage-collection passes
    pub gc_interval_secs: u64,

    /// Attempts per map operation on transient failures
    pub retry_max_attempts: u32,

    /// Delay before the first retry (in milliseconds)
    pub retry_initial_delay_ms: u64,
}

impl Default for LbMapConfig {
    fn default() -> Self {
        Self {
            pin_root: PathBuf::from(DEFAULT_PIN_ROOT),
            object_path: None,
            affinity_max_entries: MAX_ENTRIES,
            cache: true,
            gc_interval_secs: 30,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 50,
        }
    }
}

impl LbMapConfig {
    /// Load the configuration, reading `path` if given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("LBMAP").try_parsing(true));

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.affinity_max_entries == 0 {
            return Err(Error::Config("affinity_max_entries must be non-zero".into()));
        }
        if self.gc_interval_secs == 0 {
            return Err(Error::Config("gc_interval_secs must be non-zero".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(Error::Config("retry_max_attempts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new()
            .max_attempts(self.retry_max_attempts)
            .initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
    }
}
