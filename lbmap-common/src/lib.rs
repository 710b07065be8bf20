//! Shared building blocks for the load-balancer map layer.
//!
//! This crate describes the byte-exact records exchanged with the in-kernel
//! load balancer: field layouts, the codec every key/value implements, the
//! per-field byte-order rules, and the session-affinity key/value types.
//! It never touches the kernel itself.

pub mod byteorder;
pub mod error;
pub mod layout;
pub mod metrics;
pub mod types;

/// Reexport of common types
pub use error::Error;
pub use layout::{FieldLayout, Record, RecordLayout, RecordReader, RecordWriter};
pub type Result<T> = std::result::Result<T, Error>;
