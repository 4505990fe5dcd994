//! Guest I/O emulation core.
//!
//! This module is the part of the VMM that sits between a trapped vCPU
//! exit and either (a) a handler already registered in-process, or (b) a
//! hand-off to the device model running in a cooperating guest. It is
//! deliberately decoupled from the KVM specifics in [`crate::kvm`] and
//! [`crate::hypervisor`] — everything here operates on [`IoRequest`]
//! values and opaque handler/emulator traits, so it can be unit tested
//! without a `/dev/kvm`.
//!
//! # Two-phase emulation
//!
//! 1. The exit entry point ([`crate::hypervisor`]) builds an [`IoRequest`]
//!    from the hardware exit qualification and calls [`emulate_io`].
//! 2. [`emulate_io`] dispatches through the PIO or MMIO handler table. A
//!    full match runs the handler inline and returns [`IoOutcome::Handled`].
//!    No match means either partition-mode synthesis or a hand-off to the
//!    device model bridge, returning [`IoOutcome::Pending`].
//! 3. For a `Handled` read, the caller immediately runs the matching
//!    post-work ([`emulate_pio_post`] / [`emulate_mmio_post`]) and resumes.
//! 4. For `Pending`, the vCPU is parked. Later, [`emulate_io_post`] is
//!    called when the device model has completed the request (observed
//!    via the SMP-call notification in [`crate::smp`]); it runs the same
//!    post-work and signals the caller to resume — or, for a zombie vCPU,
//!    silently discards the result.

pub mod bridge;
pub mod mmio;
pub mod pio;
pub mod request;

pub use bridge::{DeviceModelChannel, SharedRing};
pub use mmio::MmioDevice;
pub use pio::PioDevice;
pub use request::{Direction, EmulationError, IoRequest, MmioPayload, PortPayload};

use mmio::MmioHandlerTable;
use pio::{PioBitmap, PioHandlerTable};

/// Whether this VM is statically partitioned (no device model at all —
/// unclaimed reads synthesize all-ones) or runs a device model in a
/// privileged companion guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Normal,
    Partitioned,
}

/// Result of a successful call to [`emulate_io`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// A handler ran inline (or partition-mode synthesis applied); the
    /// caller should run post-work now and resume.
    Handled,
    /// Handed off to the device model; the caller must not resume until
    /// [`emulate_io_post`] says so.
    Pending,
}

/// Told what to do after a completion wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    /// Spurious wake-up, or the vCPU was a zombie: do nothing.
    NoOp,
    /// Post-work ran; resume the vCPU.
    Resume,
}

/// Re-enters the external instruction decoder/emulator so a freshly
/// populated MMIO read value lands in the guest register or memory
/// location the decoded instruction names. Instruction decoding itself is
/// out of scope for this core (see spec.md's collaborator list); this
/// trait is the seam.
pub trait InstructionEmulator {
    fn write_back(&mut self, req: &IoRequest);
}

/// Removes an MMIO range from the privileged guest's identity EPT
/// mapping so subsequent accesses trap. EPT primitives are an external
/// collaborator; this trait is the seam.
pub trait EptUnmap {
    fn unmap_identity(&mut self, start: u64, end: u64);
}

/// `setup_io_bitmap`: allocate and fill the two-page PIO bitmap for a
/// guest of the given privilege.
pub fn setup_io_bitmap(privileged_guest: bool) -> PioBitmap {
    PioBitmap::new(privileged_guest)
}

/// The per-VM I/O slice: handler tables, trap bitmap, and the shared ring
/// used to hand requests to the device model. Mirrors "VM.state (I/O
/// slice)" in the data model.
pub struct VmIoState {
    pio: PioHandlerTable,
    mmio: MmioHandlerTable,
    bitmap: PioBitmap,
    privileged: bool,
    mode: IoMode,
    ring: SharedRing,
    /// At most one outstanding request per vCPU (spec invariant); `None`
    /// means the vCPU has nothing in flight.
    pending: Vec<Option<IoRequest>>,
}

impl VmIoState {
    pub fn new(privileged: bool, mode: IoMode, vcpu_count: usize) -> Self {
        Self {
            pio: PioHandlerTable::new(),
            mmio: MmioHandlerTable::new(),
            bitmap: setup_io_bitmap(privileged),
            privileged,
            mode,
            ring: SharedRing::new(vcpu_count),
            pending: vec![None; vcpu_count],
        }
    }

    /// `register_io_emulation_handler`: prepend a PIO handler and, for the
    /// privileged guest, mark its ports as trapped in the bitmap.
    pub fn register_pio_handler(&mut self, base: u16, len: u16, device: Box<dyn PioDevice>) {
        self.pio.register(base, len, device);
        if self.privileged {
            pio::deny_guest_io_access(&mut self.bitmap, base, len);
        }
    }

    /// `register_mmio_emulation_handler`: append an MMIO handler and, for
    /// the privileged guest, unmap the range from its identity EPT view.
    pub fn register_mmio_handler(
        &mut self,
        start: u64,
        end: u64,
        device: Box<dyn MmioDevice>,
        ept: &mut dyn EptUnmap,
    ) {
        self.mmio.register(start, end, device);
        if self.privileged {
            ept.unmap_identity(start, end);
        }
    }

    /// `unregister_mmio_emulation_handler`.
    pub fn unregister_mmio_handler(&mut self, start: u64, end: u64) -> bool {
        self.mmio.unregister(start, end)
    }

    /// Marks the VM as launched: further MMIO registration is a bug.
    pub fn mark_launched(&mut self) {
        self.mmio.mark_launched();
    }

    pub fn bitmap(&self) -> &PioBitmap {
        &self.bitmap
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    /// `emulate_io`: dispatch `req` for `vcpu_id`, falling back to
    /// partition-mode synthesis or the device-model bridge when no
    /// handler covers the address.
    pub fn emulate_io(
        &mut self,
        vcpu_id: usize,
        req: &mut IoRequest,
        channel: &dyn DeviceModelChannel,
    ) -> Result<IoOutcome, EmulationError> {
        debug_assert!(
            self.pending[vcpu_id].is_none(),
            "vCPU {vcpu_id} already has an outstanding I/O request"
        );

        let outcome = match req {
            IoRequest::PortIo(_) | IoRequest::PciConfig(_) => self.pio.dispatch(req)?,
            IoRequest::Mmio(_) | IoRequest::WriteProtect(_) => self.mmio.dispatch(req)?,
        };

        match outcome {
            pio::DispatchOutcome::Handled => Ok(IoOutcome::Handled),
            pio::DispatchOutcome::NoDevice => self.no_device_fallback(vcpu_id, req, channel),
        }
    }

    // `mmio::DispatchOutcome` and `pio::DispatchOutcome` are structurally
    // identical two-variant enums; dispatch() above returns whichever one
    // matches the branch taken, and this match arm handles both uniformly
    // because `NoDevice`/`Handled` are matched by name, not by type.
    fn no_device_fallback(
        &mut self,
        vcpu_id: usize,
        req: &mut IoRequest,
        channel: &dyn DeviceModelChannel,
    ) -> Result<IoOutcome, EmulationError> {
        if self.mode == IoMode::Partitioned {
            if req.direction() == Direction::Read {
                // Open question in spec.md resolved: mask to the access
                // width so the sentinel doesn't leak into the unused
                // high bits of the destination register.
                req.set_value(request::mask(req.size()));
            }
            return Ok(IoOutcome::Handled);
        }

        self.ring.slot(vcpu_id).insert_request_wait(vcpu_id as u32, req, channel);
        self.pending[vcpu_id] = Some(*req);
        Ok(IoOutcome::Pending)
    }

    /// `emulate_io_post`: called when the vCPU becomes runnable again
    /// after a (possible) device-model completion.
    pub fn emulate_io_post(
        &mut self,
        vcpu_id: usize,
        zombie: bool,
        rax: &mut u64,
        emu: &mut dyn InstructionEmulator,
    ) -> PostAction {
        let Some(result) = self.ring.slot(vcpu_id).take_if_complete() else {
            return PostAction::NoOp;
        };

        if zombie {
            self.pending[vcpu_id] = None;
            return PostAction::NoOp;
        }

        let Some(mut original) = self.pending[vcpu_id].take() else {
            return PostAction::NoOp;
        };
        original.set_value(result.value);

        if original.is_port_shaped() {
            dm_emulate_pio_post(rax, &original);
        } else {
            dm_emulate_mmio_post(emu, &original);
        }
        PostAction::Resume
    }
}

/// PIO post-work: replace the low `8*size` bits of RAX with the read
/// result, preserving the rest. A no-op for writes.
pub fn emulate_pio_post(rax: &mut u64, req: &IoRequest) {
    if req.direction() != Direction::Read {
        return;
    }
    let m = request::mask(req.size());
    *rax = (*rax & !m) | (req.value() & m);
}

/// MMIO post-work: re-enter the instruction emulator so it writes the
/// freshly populated value into the decoded destination. A no-op for
/// writes.
pub fn emulate_mmio_post(emu: &mut dyn InstructionEmulator, req: &IoRequest) {
    if req.direction() == Direction::Read {
        emu.write_back(req);
    }
}

/// Completion-path alias for [`emulate_pio_post`] — same post-work,
/// called from [`VmIoState::emulate_io_post`] instead of the exit-entry
/// fast path. PciConfig is routed here because it shares PortIo's payload.
pub fn dm_emulate_pio_post(rax: &mut u64, req: &IoRequest) {
    emulate_pio_post(rax, req);
}

/// Completion-path alias for [`emulate_mmio_post`].
pub fn dm_emulate_mmio_post(emu: &mut dyn InstructionEmulator, req: &IoRequest) {
    emulate_mmio_post(emu, req);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::pio::PioDevice;
    use request::{MmioPayload, PortPayload};

    struct NullChannel;
    impl DeviceModelChannel for NullChannel {
        fn notify_queued(&self, _vcpu_id: u32) {}
    }

    struct RecordingEmulator {
        last: Option<u64>,
    }
    impl InstructionEmulator for RecordingEmulator {
        fn write_back(&mut self, req: &IoRequest) {
            self.last = Some(req.value());
        }
    }

    struct FixedDevice(u64);
    impl PioDevice for FixedDevice {
        fn io_read(&mut self, _offset: u16, _size: u8) -> u64 {
            self.0
        }
        fn io_write(&mut self, _offset: u16, _size: u8, value: u64) {
            self.0 = value;
        }
    }

    #[test]
    fn handled_pio_read_runs_post_work_on_rax() {
        let mut state = VmIoState::new(false, IoMode::Normal, 1);
        state.register_pio_handler(0x3f8, 8, Box::new(FixedDevice(0x42)));

        let mut req = IoRequest::PortIo(PortPayload {
            direction: Direction::Read,
            address: 0x3f8,
            size: 1,
            value: 0,
        });
        let outcome = state.emulate_io(0, &mut req, &NullChannel).unwrap();
        assert_eq!(outcome, IoOutcome::Handled);

        let mut rax = 0xFFFF_FFFF_FFFF_FF00u64;
        emulate_pio_post(&mut rax, &req);
        assert_eq!(rax, 0xFFFF_FFFF_FFFF_FF42);
    }

    #[test]
    fn partitioned_no_device_read_returns_masked_all_ones() {
        let mut state = VmIoState::new(false, IoMode::Partitioned, 1);
        let mut req = IoRequest::PortIo(PortPayload {
            direction: Direction::Read,
            address: 0x300,
            size: 2,
            value: 0,
        });
        let outcome = state.emulate_io(0, &mut req, &NullChannel).unwrap();
        assert_eq!(outcome, IoOutcome::Handled);
        assert_eq!(req.value(), 0xFFFF);
    }

    #[test]
    fn no_device_normal_mode_goes_pending_and_completes() {
        let mut state = VmIoState::new(false, IoMode::Normal, 1);
        let mut req = IoRequest::PortIo(PortPayload {
            direction: Direction::Write,
            address: 0xcf8,
            size: 4,
            value: 0x8000_1000,
        });
        let outcome = state.emulate_io(0, &mut req, &NullChannel).unwrap();
        assert_eq!(outcome, IoOutcome::Pending);

        // Device model services it.
        state.ring().slot(0).complete(0);

        let mut rax = 0;
        let mut emu = RecordingEmulator { last: None };
        let action = state.emulate_io_post(0, false, &mut rax, &mut emu);
        assert_eq!(action, PostAction::Resume);
    }

    #[test]
    fn mmio_completion_writes_back_through_instruction_emulator() {
        let mut state = VmIoState::new(false, IoMode::Normal, 1);
        let mut req = IoRequest::Mmio(MmioPayload {
            direction: Direction::Read,
            address: 0xfee0_0020,
            size: 4,
            value: 0,
        });
        let outcome = state.emulate_io(0, &mut req, &NullChannel).unwrap();
        assert_eq!(outcome, IoOutcome::Pending);

        // Device model services it.
        state.ring().slot(0).complete(0xdead_beef);

        let mut rax = 0;
        let mut emu = RecordingEmulator { last: None };
        let action = state.emulate_io_post(0, false, &mut rax, &mut emu);
        assert_eq!(action, PostAction::Resume);
        assert_eq!(emu.last, Some(0xdead_beef));
    }

    #[test]
    fn zombie_short_circuit_never_resumes() {
        let mut state = VmIoState::new(false, IoMode::Normal, 1);
        let mut req = IoRequest::Mmio(MmioPayload {
            direction: Direction::Read,
            address: 0xfee0_0020,
            size: 4,
            value: 0,
        });
        state.emulate_io(0, &mut req, &NullChannel).unwrap();
        state.ring().slot(0).complete(0xdead_beef);

        let mut rax = 0;
        let mut emu = RecordingEmulator { last: None };
        let action = state.emulate_io_post(0, true, &mut rax, &mut emu);
        assert_eq!(action, PostAction::NoOp);
        assert!(emu.last.is_none());
    }

    #[test]
    fn spurious_wakeup_before_completion_is_noop() {
        let mut state = VmIoState::new(false, IoMode::Normal, 1);
        let mut req = IoRequest::PortIo(PortPayload {
            direction: Direction::Read,
            address: 0x9999,
            size: 1,
            value: 0,
        });
        state.emulate_io(0, &mut req, &NullChannel).unwrap();

        let mut rax = 0;
        let mut emu = RecordingEmulator { last: None };
        let action = state.emulate_io_post(0, false, &mut rax, &mut emu);
        assert_eq!(action, PostAction::NoOp);
    }

    #[test]
    fn privileged_guest_traps_registered_pio_range() {
        let mut state = VmIoState::new(true, IoMode::Normal, 1);
        assert!(!state.bitmap().is_trapped(0x3f8));
        state.register_pio_handler(0x3f8, 8, Box::new(FixedDevice(0)));
        for p in 0x3f8..0x400 {
            assert!(state.bitmap().is_trapped(p));
        }
    }

    #[test]
    fn mmio_registration_unmaps_ept_for_privileged_guest() {
        struct TrackingEpt {
            calls: Vec<(u64, u64)>,
        }
        impl EptUnmap for TrackingEpt {
            fn unmap_identity(&mut self, start: u64, end: u64) {
                self.calls.push((start, end));
            }
        }

        struct Dev;
        impl MmioDevice for Dev {
            fn mmio_read(&mut self, _offset: u64, _data: &mut [u8]) {}
            fn mmio_write(&mut self, _offset: u64, _data: &[u8]) {}
        }

        let mut state = VmIoState::new(true, IoMode::Normal, 1);
        let mut ept = TrackingEpt { calls: Vec::new() };
        state.register_mmio_handler(0xd000_0000, 0xd000_1000, Box::new(Dev), &mut ept);
        assert_eq!(ept.calls, vec![(0xd000_0000, 0xd000_1000)]);
    }
}
