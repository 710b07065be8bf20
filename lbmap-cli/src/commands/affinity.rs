//! Affinity command implementation for lbmapctl

use anyhow::{Context, Result};
use lbmap_common::types::{BackendId, RevNatId};
use lbmap_maps::{LbMapConfig, MapRegistry, PinnedBackend, Teardown};
use log::info;
use std::collections::HashSet;

use crate::utils::{parse_binding, print_header};
use crate::AffinityCommands;

/// Handle affinity-map commands
pub async fn handle_command(cmd: AffinityCommands, config: &LbMapConfig) -> Result<()> {
    let registry = open_registry(config)?;

    match cmd {
        AffinityCommands::List => list_bindings(&registry)?,
        AffinityCommands::Bind { backend, rev_nat } => {
            registry
                .affinity()
                .bind(BackendId(backend), RevNatId(rev_nat))
                .with_context(|| format!("Failed to bind backend {} to {}", backend, rev_nat))?;
            println!("Bound backend {} to service {}", backend, rev_nat);
        }
        AffinityCommands::Unbind { backend, rev_nat } => {
            let removed = registry
                .affinity()
                .unbind(BackendId(backend), RevNatId(rev_nat))
                .with_context(|| format!("Failed to unbind backend {} from {}", backend, rev_nat))?;
            if removed {
                println!("Unbound backend {} from service {}", backend, rev_nat);
            } else {
                println!("Backend {} was not bound to service {}", backend, rev_nat);
            }
        }
        AffinityCommands::Flush => {
            let removed = registry.affinity().flush().context("Failed to flush affinity map")?;
            println!("Removed {} bindings", removed);
        }
        AffinityCommands::Gc { keep } => {
            let authoritative = keep
                .iter()
                .map(|s| parse_binding(s))
                .collect::<Result<HashSet<_>>>()?;
            let report = registry
                .affinity()
                .reconcile(&authoritative)
                .context("Affinity GC failed")?;
            println!("GC: {}", report);
        }
        AffinityCommands::Stats => show_stats(&registry, config)?,
    }

    registry.close(Teardown::Keep)?;
    Ok(())
}

fn open_registry(config: &LbMapConfig) -> Result<MapRegistry<PinnedBackend>> {
    info!("Opening maps under {}", config.pin_root.display());
    MapRegistry::pinned(config)
        .with_context(|| format!("Failed to open maps under {}", config.pin_root.display()))
}

fn list_bindings(registry: &MapRegistry<PinnedBackend>) -> Result<()> {
    let mut bindings = registry
        .affinity()
        .bindings()
        .context("Failed to read affinity map")?;
    bindings.sort_by_key(|k| (k.rev_nat_id, k.backend_id));

    print_header("Affinity bindings");
    println!("{:<12} {}", "BACKEND", "REVNAT");
    for key in &bindings {
        println!("{:<12} {}", key.backend_id.0, key.rev_nat_id.0);
    }
    println!("\n{} bindings", bindings.len());
    Ok(())
}

fn show_stats(registry: &MapRegistry<PinnedBackend>, config: &LbMapConfig) -> Result<()> {
    let affinity = registry.affinity();
    let entries = affinity.len().context("Failed to read affinity map")?;

    print_header("Affinity map");
    println!("  Entries:  {} / {}", entries, config.affinity_max_entries);
    println!("  Cached:   {}", affinity.table().is_cached());
    for (name, stats) in registry.stats() {
        println!("  {}: {}", name, stats);
    }
    Ok(())
}
