//! Layout command implementation for lbmapctl

use anyhow::{Context, Result};
use lbmap_common::{
    types::{AffinityMatchKey, AffinityMatchValue},
    Record, RecordLayout,
};

use crate::utils::print_header;

/// Print every record layout with its field offsets
pub fn show_layouts() -> Result<()> {
    AffinityMatchKey::check_layout().context("affinity match key layout is invalid")?;
    AffinityMatchValue::check_layout().context("affinity match value layout is invalid")?;

    print_layout(AffinityMatchKey::layout());
    print_layout(AffinityMatchValue::layout());
    Ok(())
}

fn print_layout(layout: &RecordLayout) {
    print_header(&format!("{} ({} bytes)", layout.name, layout.size));
    println!("{:<8} {:<16} {:<6} {}", "OFFSET", "FIELD", "WIDTH", "ORDER");
    for (offset, field) in layout.fields_with_offsets() {
        let order = if field.padding {
            "padding".to_string()
        } else {
            field.order.to_string()
        };
        println!("{:<8} {:<16} {:<6} {}", offset, field.name, field.width, order);
    }
}
