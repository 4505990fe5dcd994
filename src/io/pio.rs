//! Port-I/O handler table and trap bitmap.
//!
//! Mirrors the shape of [`super::mmio::MmioHandlerTable`] for port space:
//! a small, insertion-ordered list of disjoint ranges, plus the hardware
//! trap bitmap that tells KVM which ports must exit to us at all.

use super::request::{mask, Direction, EmulationError, IoRequest, PortPayload};

/// Devices that answer port-I/O accesses.
///
/// `offset` is the port minus the handler's registered base; `size` is the
/// access width in bytes (1, 2, or 4 for PIO). Implementations see every
/// access to their range regardless of width — a 4-byte `OUT` to a 1-byte
/// register device still calls `io_write` once with `size == 4`, the same
/// way the spec's C `write_fn(vm, addr, size, value)` does.
pub trait PioDevice {
    fn io_read(&mut self, offset: u16, size: u8) -> u64;
    fn io_write(&mut self, offset: u16, size: u8, value: u64);
}

struct PioHandlerEntry {
    base: u16,
    len: u16,
    device: Box<dyn PioDevice>,
}

/// One page of the hardware PIO bitmap: one bit per port, 1 = trap.
const BITMAP_PAGE_BYTES: usize = 4096;
const BITMAP_PAGE_PORTS: u32 = (BITMAP_PAGE_BYTES * 8) as u32;

/// The two-page PIO trap bitmap covering all 65536 ports.
///
/// Page A covers ports `0x0000..=0x7FFF`, page B covers `0x8000..=0xFFFF`.
/// This layout is architectural (it is handed to hardware verbatim) and is
/// not something a reimplementation gets to choose.
pub struct PioBitmap {
    page_a: Vec<u8>,
    page_b: Vec<u8>,
}

impl PioBitmap {
    /// `setup_io_bitmap`: allocate both pages and fill them per guest kind.
    /// Privileged guests default to pass-through (0x00, bits clear, no
    /// trapping); unprivileged guests default to trap-everything (0xFF).
    pub fn new(privileged_guest: bool) -> Self {
        let fill = if privileged_guest { 0x00 } else { 0xFF };
        Self {
            page_a: vec![fill; BITMAP_PAGE_BYTES],
            page_b: vec![fill; BITMAP_PAGE_BYTES],
        }
    }

    fn page_for(&mut self, port: u16) -> &mut Vec<u8> {
        if port < 0x8000 {
            &mut self.page_a
        } else {
            &mut self.page_b
        }
    }

    pub fn is_trapped(&self, port: u16) -> bool {
        let page = if port < 0x8000 {
            &self.page_a
        } else {
            &self.page_b
        };
        let idx = (port & 0x7FFF) as usize;
        page[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn set_bit(&mut self, port: u16, trapped: bool) {
        let idx = (port & 0x7FFF) as usize;
        let page = self.page_for(port);
        if trapped {
            page[idx / 8] |= 1 << (idx % 8);
        } else {
            page[idx / 8] &= !(1 << (idx % 8));
        }
    }

    /// Raw page bytes, in the layout KVM's `KVM_SET_PIT`-style bitmap
    /// ioctls expect (exposed for a future wiring to the real ioctl; this
    /// core does not issue it itself, see `EptUnmap`/bitmap-install
    /// collaborators in `DESIGN.md`).
    pub fn pages(&self) -> (&[u8], &[u8]) {
        (&self.page_a, &self.page_b)
    }
}

/// `deny_guest_io_access`: set `n` consecutive bits starting at `port`
/// (mark them trapped).
pub fn deny_guest_io_access(bitmap: &mut PioBitmap, port: u16, n: u16) {
    let mut p = port as u32;
    let end = port as u32 + n as u32;
    while p < end && p <= u16::MAX as u32 {
        bitmap.set_bit(p as u16, true);
        p += 1;
    }
}

/// `allow_guest_io_access`: clear `n` consecutive bits starting at `port`
/// (mark them pass-through). Only meaningful for the privileged guest.
pub fn allow_guest_io_access(bitmap: &mut PioBitmap, port: u16, n: u16) {
    let mut p = port as u32;
    let end = port as u32 + n as u32;
    while p < end && p <= u16::MAX as u32 {
        bitmap.set_bit(p as u16, false);
        p += 1;
    }
}

/// Outcome of a region scan that did not hit an error.
pub enum DispatchOutcome {
    Handled,
    NoDevice,
}

/// Per-VM PIO handler table, in registration order (new handlers are
/// prepended, so the first match is the most recently registered one that
/// still claims the address — see `register`).
#[derive(Default)]
pub struct PioHandlerTable {
    handlers: Vec<PioHandlerEntry>,
}

impl Default for PioBitmap {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PioHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `register_pio_handler`: requires the range to be disjoint from every
    /// already-registered range (the spec's invariant enforced at the
    /// single mutation point, rather than re-checked on every dispatch).
    /// If the VM is the privileged guest, the caller is expected to also
    /// call `deny_guest_io_access` over `[base, base+len)` so the bitmap
    /// traps the newly claimed ports.
    pub fn register(&mut self, base: u16, len: u16, device: Box<dyn PioDevice>) {
        debug_assert!(
            !self.overlaps(base, len),
            "PIO handler ranges must be disjoint"
        );
        self.handlers.insert(0, PioHandlerEntry { base, len, device });
    }

    fn overlaps(&self, base: u16, len: u16) -> bool {
        let (start, end) = (base as u32, base as u32 + len as u32);
        self.handlers.iter().any(|h| {
            let (hs, he) = (h.base as u32, h.base as u32 + h.len as u32);
            start < he && hs < end
        })
    }

    /// Region-dispatch scan per the spec's match rule: full-outside
    /// continues, full-inside invokes the handler and stops, any partial
    /// overlap aborts the whole scan with `SpanError`.
    pub fn dispatch(
        &mut self,
        req: &mut IoRequest,
    ) -> Result<DispatchOutcome, EmulationError> {
        let IoRequest::PortIo(payload) | IoRequest::PciConfig(payload) = req else {
            return Err(EmulationError::Invalid);
        };
        let addr = payload.address;
        let size = payload.size as u64;
        let access_end = addr + size;

        for entry in self.handlers.iter_mut() {
            let base = entry.base as u64;
            let end = base + entry.len as u64;

            if access_end <= base || addr >= end {
                continue;
            }
            if addr >= base && access_end <= end {
                let offset = (addr - base) as u16;
                match payload.direction {
                    Direction::Read => {
                        payload.value = entry.device.io_read(offset, payload.size) & mask(payload.size);
                    }
                    Direction::Write => {
                        entry
                            .device
                            .io_write(offset, payload.size, payload.value & mask(payload.size));
                    }
                }
                return Ok(DispatchOutcome::Handled);
            }
            return Err(EmulationError::SpanError);
        }
        Ok(DispatchOutcome::NoDevice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        reads: u64,
        writes: u64,
        value: u8,
    }

    impl PioDevice for Counter {
        fn io_read(&mut self, _offset: u16, _size: u8) -> u64 {
            self.reads += 1;
            self.value as u64
        }
        fn io_write(&mut self, _offset: u16, _size: u8, value: u64) {
            self.writes += 1;
            self.value = value as u8;
        }
    }

    fn port_req(direction: Direction, address: u64, size: u8, value: u64) -> IoRequest {
        IoRequest::PortIo(PortPayload {
            direction,
            address,
            size,
            value,
        })
    }

    #[test]
    fn full_match_read_write() {
        let mut table = PioHandlerTable::new();
        table.register(
            0x3f8,
            8,
            Box::new(Counter {
                reads: 0,
                writes: 0,
                value: 0x42,
            }),
        );

        let mut req = port_req(Direction::Read, 0x3f8, 1, 0);
        assert!(matches!(
            table.dispatch(&mut req).unwrap(),
            DispatchOutcome::Handled
        ));
        assert_eq!(req.value(), 0x42);
    }

    #[test]
    fn no_device_for_unclaimed_port() {
        let mut table = PioHandlerTable::new();
        let mut req = port_req(Direction::Read, 0xcf8, 4, 0);
        assert!(matches!(
            table.dispatch(&mut req).unwrap(),
            DispatchOutcome::NoDevice
        ));
    }

    #[test]
    fn span_error_on_partial_overlap() {
        let mut table = PioHandlerTable::new();
        table.register(
            0x60,
            4,
            Box::new(Counter {
                reads: 0,
                writes: 0,
                value: 0,
            }),
        );
        // [0x62, 0x66) straddles the top of [0x60, 0x64).
        let mut req = port_req(Direction::Read, 0x62, 4, 0);
        assert_eq!(table.dispatch(&mut req), Err(EmulationError::SpanError));
    }

    #[test]
    fn allow_deny_round_trip() {
        let mut bitmap = PioBitmap::new(true);
        assert!(!bitmap.is_trapped(0x3f8));
        deny_guest_io_access(&mut bitmap, 0x3f8, 8);
        for p in 0x3f8..0x400 {
            assert!(bitmap.is_trapped(p));
        }
        allow_guest_io_access(&mut bitmap, 0x3f8, 8);
        for p in 0x3f8..0x400 {
            assert!(!bitmap.is_trapped(p));
        }
    }

    #[test]
    fn unprivileged_guest_traps_by_default() {
        let bitmap = PioBitmap::new(false);
        assert!(bitmap.is_trapped(0x3f8));
        assert!(bitmap.is_trapped(0x8000));
    }
}
