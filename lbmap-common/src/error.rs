//! Error types for the load-balancer map layer.

use std::io;
use thiserror::Error;

/// All possible errors that can occur while talking to a kernel-shared table.
///
/// A missing key is not represented here: lookups return `Option` and
/// deletions report whether anything was removed.
#[derive(Error, Debug)]
pub enum Error {
    /// An existing kernel table does not match the requested identity.
    #[error("incompatible layout for map {map}: {reason}")]
    IncompatibleLayout { map: String, reason: String },

    /// The table is at its maximum entry count.
    #[error("map {map} is full ({max_entries} entries)")]
    CapacityExceeded { map: String, max_entries: u32 },

    /// A raw record does not have the size its layout declares.
    #[error("malformed {layout} record: expected {expected} bytes, got {actual}")]
    MalformedRecord {
        layout: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A layout descriptor is internally inconsistent.
    #[error("invalid record layout {layout}: {reason}")]
    InvalidLayout { layout: &'static str, reason: String },

    /// A create-only insert hit an existing key.
    #[error("key already exists in map {map}")]
    KeyExists { map: String },

    /// The kernel asked us to try again (EAGAIN, EBUSY, EINTR).
    #[error("transient failure in {call} on map {map}: {source}")]
    Transient {
        map: String,
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// Any other failed map syscall.
    #[error("{call} failed on map {map}: {source}")]
    Syscall {
        map: String,
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// Error loading or pinning eBPF objects.
    #[error("eBPF error: {0}")]
    Ebpf(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Whether the error should stop the process from using the table at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IncompatibleLayout { .. } | Error::InvalidLayout { .. }
        )
    }
}
