//! Utility functions for lbmapctl

use anyhow::{anyhow, Context, Result};
use lbmap_common::types::{AffinityMatchKey, BackendId, RevNatId};

/// Parse a binding written as `BACKEND:REVNAT`
pub fn parse_binding(s: &str) -> Result<AffinityMatchKey> {
    let (backend, rev_nat) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid binding {:?}, expected BACKEND:REVNAT", s))?;
    let backend = backend
        .trim()
        .parse()
        .with_context(|| format!("invalid backend ID in {:?}", s))?;
    let rev_nat = rev_nat
        .trim()
        .parse()
        .with_context(|| format!("invalid reverse-NAT ID in {:?}", s))?;
    Ok(AffinityMatchKey::new(BackendId(backend), RevNatId(rev_nat)))
}

/// Print a section header in the CLI output
pub fn print_header(title: &str) {
    let separator = "=".repeat(title.len());
    println!("\n{}", title);
    println!("{}", separator);
}
