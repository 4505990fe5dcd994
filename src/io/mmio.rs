//! MMIO handler table.
//!
//! Unlike the PIO table, MMIO handlers are appended (not prepended) and can
//! only be registered before any vCPU of the owning VM has been launched —
//! the spec calls this an assertion, not a user-visible error, so we model
//! it the same way: a debug-only check, not a `Result`.

use super::request::{Direction, EmulationError, IoRequest, MmioPayload};

/// Devices that answer MMIO accesses. `offset` is the address minus the
/// handler's registered `start`.
pub trait MmioDevice {
    fn mmio_read(&mut self, offset: u64, data: &mut [u8]);
    fn mmio_write(&mut self, offset: u64, data: &[u8]);
}

struct MmioHandlerEntry {
    start: u64,
    end: u64,
    device: Box<dyn MmioDevice>,
}

pub enum DispatchOutcome {
    Handled,
    NoDevice,
}

/// Per-VM MMIO handler table.
#[derive(Default)]
pub struct MmioHandlerTable {
    handlers: Vec<MmioHandlerEntry>,
    /// Set once the owning VM's first vCPU has run; further registration
    /// is a bug (debug assertion), matching the spec's pre-launch
    /// requirement.
    launched: bool,
}

impl MmioHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the VM as launched. Called once, before the first `vcpu.run()`.
    pub fn mark_launched(&mut self) {
        self.launched = true;
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.handlers
            .iter()
            .any(|h| start < h.end && h.start < end)
    }

    /// `register_mmio_handler`: `end > start` is required; registering
    /// after launch or over an already-claimed range is a debug-only bug,
    /// not a recoverable error, matching the spec's assertion semantics.
    /// Returns the `[start, end)` range so the caller can unmap it from
    /// the privileged guest's identity EPT view (an external collaborator
    /// — see `EptUnmap` in `DESIGN.md`).
    pub fn register(&mut self, start: u64, end: u64, device: Box<dyn MmioDevice>) {
        debug_assert!(end > start, "MMIO range must be non-empty");
        debug_assert!(!self.launched, "MMIO registration after vCPU launch");
        debug_assert!(!self.overlaps(start, end), "MMIO ranges must be disjoint");
        self.handlers.push(MmioHandlerEntry { start, end, device });
    }

    /// `unregister_mmio_handler`: exact-bounds match, removes at most the
    /// first entry found. Duplicates are impossible under the disjointness
    /// invariant enforced at `register`, so "first match" is never
    /// ambiguous in practice (spec.md open question).
    pub fn unregister(&mut self, start: u64, end: u64) -> bool {
        if let Some(idx) = self
            .handlers
            .iter()
            .position(|h| h.start == start && h.end == end)
        {
            self.handlers.remove(idx);
            true
        } else {
            false
        }
    }

    /// Region-dispatch scan, same match rule as the PIO table: full-outside
    /// continues, full-inside invokes and stops, partial overlap aborts
    /// with `SpanError`.
    pub fn dispatch(
        &mut self,
        req: &mut IoRequest,
    ) -> Result<DispatchOutcome, EmulationError> {
        let IoRequest::Mmio(payload) | IoRequest::WriteProtect(payload) = req else {
            return Err(EmulationError::Invalid);
        };
        let addr = payload.address;
        let access_end = addr + payload.size as u64;

        for entry in self.handlers.iter_mut() {
            if access_end <= entry.start || addr >= entry.end {
                continue;
            }
            if addr >= entry.start && access_end <= entry.end {
                let offset = addr - entry.start;
                match payload.direction {
                    Direction::Read => {
                        let mut buf = [0u8; 8];
                        let n = payload.size as usize;
                        entry.device.mmio_read(offset, &mut buf[..n]);
                        let mut value = 0u64;
                        for (i, b) in buf[..n].iter().enumerate() {
                            value |= (*b as u64) << (8 * i);
                        }
                        payload.value = value;
                    }
                    Direction::Write => {
                        let n = payload.size as usize;
                        let bytes = payload.value.to_le_bytes();
                        entry.device.mmio_write(offset, &bytes[..n]);
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

    struct Reg32 {
        value: u32,
    }

    impl MmioDevice for Reg32 {
        fn mmio_read(&mut self, offset: u64, data: &mut [u8]) {
            if offset == 0 {
                let bytes = self.value.to_le_bytes();
                let n = data.len().min(4);
                data[..n].copy_from_slice(&bytes[..n]);
            }
        }
        fn mmio_write(&mut self, offset: u64, data: &[u8]) {
            if offset == 0 && data.len() >= 4 {
                self.value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            }
        }
    }

    fn mmio_req(direction: Direction, address: u64, size: u8, value: u64) -> IoRequest {
        IoRequest::Mmio(MmioPayload {
            direction,
            address,
            size,
            value,
        })
    }

    #[test]
    fn read_write_round_trip() {
        let mut table = MmioHandlerTable::new();
        table.register(0x1000, 0x1100, Box::new(Reg32 { value: 0x12345678 }));

        let mut req = mmio_req(Direction::Write, 0x1000, 4, 0xdead_beef);
        assert!(matches!(
            table.dispatch(&mut req).unwrap(),
            DispatchOutcome::Handled
        ));

        let mut req = mmio_req(Direction::Read, 0x1000, 4, 0);
        table.dispatch(&mut req).unwrap();
        assert_eq!(req.value(), 0xdead_beef);
    }

    #[test]
    fn span_error_crossing_registered_boundary() {
        let mut table = MmioHandlerTable::new();
        table.register(0xfee0_0000, 0xfee0_1000, Box::new(Reg32 { value: 0 }));
        let mut req = mmio_req(Direction::Read, 0xfee0_0ffe, 4, 0);
        assert_eq!(table.dispatch(&mut req), Err(EmulationError::SpanError));
    }

    #[test]
    fn unregister_exact_match_only() {
        let mut table = MmioHandlerTable::new();
        table.register(0x1000, 0x1100, Box::new(Reg32 { value: 0 }));
        assert!(!table.unregister(0x1000, 0x1200));
        assert!(table.unregister(0x1000, 0x1100));
        let mut req = mmio_req(Direction::Read, 0x1000, 4, 0);
        assert!(matches!(
            table.dispatch(&mut req).unwrap(),
            DispatchOutcome::NoDevice
        ));
    }

    #[test]
    #[should_panic(expected = "after vCPU launch")]
    fn register_after_launch_is_a_bug() {
        let mut table = MmioHandlerTable::new();
        table.mark_launched();
        table.register(0x2000, 0x2100, Box::new(Reg32 { value: 0 }));
    }
}
