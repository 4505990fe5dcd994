//! The guest I/O request model.
//!
//! Every trapped port-I/O or MMIO access from a vCPU is normalized into an
//! [`IoRequest`] before it enters the dispatch pipeline. The variants share
//! enough of a common shape (direction, address, size, value) that a single
//! post-work function can treat `PciConfig` as if it were `PortIo` on the
//! read path (see [`IoRequest::as_port_io`]).

use thiserror::Error;

/// Direction of a trapped access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// The common payload shared by port-I/O and PCI configuration-space
/// accesses: an address (port number, zero-extended), an access width in
/// bytes, and a value (read result or write operand).
#[derive(Debug, Clone, Copy)]
pub struct PortPayload {
    pub direction: Direction,
    pub address: u64,
    pub size: u8,
    pub value: u64,
}

/// The payload for MMIO and write-protect (read-only-region) accesses.
#[derive(Debug, Clone, Copy)]
pub struct MmioPayload {
    pub direction: Direction,
    pub address: u64,
    pub size: u8,
    pub value: u64,
}

/// A normalized guest I/O request.
///
/// `PciConfig` deliberately carries the same payload shape as `PortIo` —
/// the spec requires that post-work route `PciConfig` through the PIO
/// post-work path, which only works if the two share a layout. Modeling
/// both as `PortPayload` makes that sharing explicit instead of relying on
/// a struct-prefix coincidence.
#[derive(Debug, Clone, Copy)]
pub enum IoRequest {
    PortIo(PortPayload),
    Mmio(MmioPayload),
    PciConfig(PortPayload),
    WriteProtect(MmioPayload),
}

impl IoRequest {
    pub fn direction(&self) -> Direction {
        match self {
            IoRequest::PortIo(p) | IoRequest::PciConfig(p) => p.direction,
            IoRequest::Mmio(p) | IoRequest::WriteProtect(p) => p.direction,
        }
    }

    pub fn address(&self) -> u64 {
        match self {
            IoRequest::PortIo(p) | IoRequest::PciConfig(p) => p.address,
            IoRequest::Mmio(p) | IoRequest::WriteProtect(p) => p.address,
        }
    }

    pub fn size(&self) -> u8 {
        match self {
            IoRequest::PortIo(p) | IoRequest::PciConfig(p) => p.size,
            IoRequest::Mmio(p) | IoRequest::WriteProtect(p) => p.size,
        }
    }

    pub fn value(&self) -> u64 {
        match self {
            IoRequest::PortIo(p) | IoRequest::PciConfig(p) => p.value,
            IoRequest::Mmio(p) | IoRequest::WriteProtect(p) => p.value,
        }
    }

    pub fn set_value(&mut self, value: u64) {
        match self {
            IoRequest::PortIo(p) | IoRequest::PciConfig(p) => p.value = value & mask(p.size),
            IoRequest::Mmio(p) | IoRequest::WriteProtect(p) => p.value = value & mask(p.size),
        }
    }

    /// True if this request is a `PortIo` or `PciConfig` (shares the PIO
    /// post-work path).
    pub fn is_port_shaped(&self) -> bool {
        matches!(self, IoRequest::PortIo(_) | IoRequest::PciConfig(_))
    }

    /// True if this request is an `Mmio` or `WriteProtect` (shares the MMIO
    /// dispatch list and post-work path).
    pub fn is_mmio_shaped(&self) -> bool {
        matches!(self, IoRequest::Mmio(_) | IoRequest::WriteProtect(_))
    }
}

/// `mask(size) = (1 << (8*size)) - 1`, saturating at `size == 8`.
pub fn mask(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * size as u32)) - 1
    }
}

/// Errors surfaced at the dispatch boundary. `Pending` is a semantic marker
/// (the request was handed off, not a failure); `Busy` is informational,
/// surfaced only by notification setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmulationError {
    #[error("malformed I/O request")]
    Invalid,
    #[error("access straddles a registered region boundary")]
    SpanError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_widths() {
        assert_eq!(mask(1), 0xFF);
        assert_eq!(mask(2), 0xFFFF);
        assert_eq!(mask(4), 0xFFFF_FFFF);
        assert_eq!(mask(8), u64::MAX);
    }

    #[test]
    fn set_value_masks() {
        let mut req = IoRequest::PortIo(PortPayload {
            direction: Direction::Read,
            address: 0x3f8,
            size: 1,
            value: 0,
        });
        req.set_value(0x1234);
        assert_eq!(req.value(), 0x34);
    }

    #[test]
    fn pci_config_is_port_shaped() {
        let req = IoRequest::PciConfig(PortPayload {
            direction: Direction::Read,
            address: 0xcfc,
            size: 4,
            value: 0,
        });
        assert!(req.is_port_shaped());
        assert!(!req.is_mmio_shaped());
    }
}
