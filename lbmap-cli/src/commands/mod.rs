//! Subcommand implementations for lbmapctl

pub mod affinity;
pub mod layout;
