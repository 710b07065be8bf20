//! Userspace control of the load balancer's kernel-shared maps
//!
//! Re-exports the record definitions and the map layer so a service
//! controller can depend on a single crate.

pub use lbmap_common as common;
pub use lbmap_maps as maps;

pub use lbmap_common::{Error, Result};
pub use lbmap_maps::{
    AffinityMatchMap, AffinityReconciler, LbMapConfig, MapRegistry, ServiceEvent, Teardown,
};
