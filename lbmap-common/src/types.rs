//! Types shared with the in-kernel load balancer.
//!
//! These mirror the kernel structs byte for byte; their [`Record`]
//! implementations are the only way they are turned into map records.

use crate::layout::{FieldLayout, Record, RecordLayout, RecordReader, RecordWriter};
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default capacity of the load-balancer maps, matching the datapath's
/// `CILIUM_LB_MAP_MAX_ENTRIES`.
pub const MAX_ENTRIES: u32 = 65536;

/// Name of the IPv4 session-affinity match map.
pub const AFFINITY_MATCH_MAP_NAME: &str = "cilium_lb4_affinity_match";

/// Identifier of a load-balancer backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BackendId(pub u32);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reverse-NAT identifier of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RevNatId(pub u16);

impl fmt::Display for RevNatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub static AFFINITY_MATCH_KEY_LAYOUT: RecordLayout = RecordLayout::new(
    "lb_affinity_match",
    8,
    &[
        FieldLayout::host("backend_id", 4),
        // The datapath keys this map with the rev NAT id exactly as it sits
        // in the service map, which is network order.
        FieldLayout::network("rev_nat_id", 2),
        FieldLayout::padding("pad", 2),
    ],
);

pub static AFFINITY_MATCH_VALUE_LAYOUT: RecordLayout =
    RecordLayout::new("lb_affinity_match_value", 1, &[FieldLayout::padding("pad", 1)]);

/// Marks a backend as part of a service's active set for session affinity.
///
/// Fields are held in host order; the rev NAT id is converted to network
/// order when the key is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C)]
pub struct AffinityMatchKey {
    pub backend_id: BackendId,
    pub rev_nat_id: RevNatId,
    pad: u16,
}

impl AffinityMatchKey {
    pub fn new(backend_id: BackendId, rev_nat_id: RevNatId) -> Self {
        Self {
            backend_id,
            rev_nat_id,
            pad: 0,
        }
    }
}

impl fmt::Display for AffinityMatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.backend_id, self.rev_nat_id)
    }
}

impl Record for AffinityMatchKey {
    type Raw = [u8; 8];

    fn layout() -> &'static RecordLayout {
        &AFFINITY_MATCH_KEY_LAYOUT
    }

    fn encode(&self) -> Bytes {
        RecordWriter::new(&AFFINITY_MATCH_KEY_LAYOUT)
            .put_u32(self.backend_id.0)
            .put_u16(self.rev_nat_id.0)
            .pad()
            .finish()
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        let mut reader = RecordReader::new(&AFFINITY_MATCH_KEY_LAYOUT, raw)?;
        let backend_id = BackendId(reader.get_u32());
        let rev_nat_id = RevNatId(reader.get_u16());
        reader.skip_pad();
        Ok(Self::new(backend_id, rev_nat_id))
    }
}

/// Zero-width marker: the presence of the key is the whole payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct AffinityMatchValue {
    pad: u8,
}

impl AffinityMatchValue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for AffinityMatchValue {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

impl Record for AffinityMatchValue {
    type Raw = [u8; 1];

    fn layout() -> &'static RecordLayout {
        &AFFINITY_MATCH_VALUE_LAYOUT
    }

    fn encode(&self) -> Bytes {
        RecordWriter::new(&AFFINITY_MATCH_VALUE_LAYOUT).pad().finish()
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        let mut reader = RecordReader::new(&AFFINITY_MATCH_VALUE_LAYOUT, raw)?;
        reader.skip_pad();
        Ok(Self::new())
    }
}
