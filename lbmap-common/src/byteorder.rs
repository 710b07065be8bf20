//! Host/network byte-order normalization for individual record fields.
//!
//! The datapath compares some key fields directly against packet data, so
//! those fields must sit in the map in network byte order. Everything else
//! stays in host order. The choice is made per field by the record layout,
//! never for a whole record.

use serde::Serialize;
use std::fmt;

/// Byte order a field is stored in inside a kernel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ByteOrder {
    /// Native order of the machine running the control plane.
    Host,
    /// Big endian, as found on the wire.
    Network,
}

impl ByteOrder {
    /// Convert a host-order value into the in-memory representation stored
    /// for a field with this order.
    pub const fn u16_to_wire(self, value: u16) -> u16 {
        match self {
            ByteOrder::Host => value,
            ByteOrder::Network => host_to_network_u16(value),
        }
    }

    /// Inverse of [`ByteOrder::u16_to_wire`].
    pub const fn u16_from_wire(self, value: u16) -> u16 {
        match self {
            ByteOrder::Host => value,
            ByteOrder::Network => network_to_host_u16(value),
        }
    }

    pub const fn u32_to_wire(self, value: u32) -> u32 {
        match self {
            ByteOrder::Host => value,
            ByteOrder::Network => host_to_network_u32(value),
        }
    }

    pub const fn u32_from_wire(self, value: u32) -> u32 {
        match self {
            ByteOrder::Host => value,
            ByteOrder::Network => network_to_host_u32(value),
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Host => write!(f, "host"),
            ByteOrder::Network => write!(f, "network"),
        }
    }
}

/// Swap a 16-bit value from host to network order (a no-op on big-endian hosts).
pub const fn host_to_network_u16(value: u16) -> u16 {
    value.to_be()
}

pub const fn network_to_host_u16(value: u16) -> u16 {
    u16::from_be(value)
}

pub const fn host_to_network_u32(value: u32) -> u32 {
    value.to_be()
}

pub const fn network_to_host_u32(value: u32) -> u32 {
    u32::from_be(value)
}
