//! The device-model bridge: a lock-free, ABI-stable request slot shared
//! with a cooperating device-model process.
//!
//! This crate owns only the hypervisor side of the protocol. The device
//! model itself — the process that reads `Pending` slots and writes
//! results — is an external collaborator; [`DeviceModelChannel`] is the
//! seam it plugs into (an upcall when a request is queued) and
//! [`Slot::complete`] is the seam it calls into (to post a result and flip
//! the slot to `Complete`).
//!
//! The three-state `processed` word is the only synchronization here: the
//! request bytes surrounding it are "plain" writes made visible by the
//! accompanying release store and observed only after the matching
//! acquire load, exactly as the spec requires. Anything looser (Relaxed on
//! `processed`) would let the reader see a torn or stale request body.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use super::request::{Direction, IoRequest, MmioPayload, PortPayload};

/// `processed` states. Any transition other than the cycle
/// `Free -> Pending -> Complete -> Free` is a protocol error.
const FREE: u32 = 0;
const PENDING: u32 = 1;
const COMPLETE: u32 = 2;

/// Discriminant mirroring [`IoRequest`]'s variants in the ABI payload.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    PortIo = 0,
    Mmio = 1,
    PciConfig = 2,
    WriteProtect = 3,
}

/// The wire format shared with the device model. `#[repr(C)]` so its
/// layout is stable across the process boundary.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DeviceModelRequest {
    pub kind: RequestKind,
    pub write: u32,
    pub address: u64,
    pub size: u32,
    pub value: u64,
}

impl DeviceModelRequest {
    fn from_io_request(req: &IoRequest) -> Self {
        let kind = match req {
            IoRequest::PortIo(_) => RequestKind::PortIo,
            IoRequest::Mmio(_) => RequestKind::Mmio,
            IoRequest::PciConfig(_) => RequestKind::PciConfig,
            IoRequest::WriteProtect(_) => RequestKind::WriteProtect,
        };
        Self {
            kind,
            write: (req.direction() == Direction::Write) as u32,
            address: req.address(),
            size: req.size() as u32,
            value: req.value(),
        }
    }

    /// Rebuild the typed request the hypervisor originally queued, with
    /// `value` refreshed from the device model's result.
    pub fn to_io_request(self) -> IoRequest {
        let direction = if self.write == 1 {
            Direction::Write
        } else {
            Direction::Read
        };
        match self.kind {
            RequestKind::PortIo => IoRequest::PortIo(PortPayload {
                direction,
                address: self.address,
                size: self.size as u8,
                value: self.value,
            }),
            RequestKind::PciConfig => IoRequest::PciConfig(PortPayload {
                direction,
                address: self.address,
                size: self.size as u8,
                value: self.value,
            }),
            RequestKind::Mmio => IoRequest::Mmio(MmioPayload {
                direction,
                address: self.address,
                size: self.size as u8,
                value: self.value,
            }),
            RequestKind::WriteProtect => IoRequest::WriteProtect(MmioPayload {
                direction,
                address: self.address,
                size: self.size as u8,
                value: self.value,
            }),
        }
    }
}

/// The receiver of the "a request was queued" upcall. The real
/// implementation lives on the device-model side of the process boundary;
/// here it is a seam a test double or the demo binary can implement.
pub trait DeviceModelChannel: Send + Sync {
    fn notify_queued(&self, vcpu_id: u32);
}

/// One per-vCPU shared slot.
///
/// `request` and `owner_vcpu` are written without their own
/// synchronization; correctness rests entirely on the release/acquire
/// pair around `processed`, matching the spec's ordering requirement.
pub struct Slot {
    request: UnsafeCell<DeviceModelRequest>,
    owner_vcpu: UnsafeCell<u32>,
    valid: AtomicU32,
    processed: AtomicU32,
}

// SAFETY: all access to `request`/`owner_vcpu` is gated by the
// acquire/release protocol on `processed`, which guarantees exclusive
// access alternates between the two sides of the handoff.
unsafe impl Sync for Slot {}

impl Default for Slot {
    fn default() -> Self {
        Self {
            request: UnsafeCell::new(DeviceModelRequest {
                kind: RequestKind::PortIo,
                write: 0,
                address: 0,
                size: 0,
                value: 0,
            }),
            owner_vcpu: UnsafeCell::new(0),
            valid: AtomicU32::new(0),
            processed: AtomicU32::new(FREE),
        }
    }
}

impl Slot {
    pub fn new() -> Self {
        Self::default()
    }

    /// `insert_request_wait`: write the request into the slot, flip it to
    /// `Pending`, and notify the device model. Spins until the slot is
    /// `Free` — under the "one outstanding request per vCPU" invariant
    /// this never actually iterates, but a defensive wait costs nothing
    /// and matches the spec's "may block" contract.
    pub fn insert_request_wait(
        &self,
        vcpu_id: u32,
        req: &IoRequest,
        channel: &dyn DeviceModelChannel,
    ) {
        while self.processed.load(Ordering::Acquire) != FREE {
            std::hint::spin_loop();
        }

        // SAFETY: processed == Free here, so the device model side is not
        // touching these fields (it only writes after observing Pending,
        // and only this hypervisor side writes Free -> Pending).
        unsafe {
            *self.request.get() = DeviceModelRequest::from_io_request(req);
            *self.owner_vcpu.get() = vcpu_id;
        }
        self.valid.store(1, Ordering::Relaxed);
        self.processed.store(PENDING, Ordering::Release);
        channel.notify_queued(vcpu_id);
    }

    /// Device-model side: post a result and flip the slot to `Complete`.
    /// Only valid to call while the slot is `Pending`.
    pub fn complete(&self, result_value: u64) {
        debug_assert_eq!(
            self.processed.load(Ordering::Acquire),
            PENDING,
            "device model completed a slot that was not pending"
        );
        unsafe {
            (*self.request.get()).value = result_value;
        }
        self.processed.store(COMPLETE, Ordering::Release);
    }

    /// `emulate_io_post` slot read: `None` for a spurious wake-up
    /// (`valid == 0` or not yet `Complete`), `Some` otherwise — frees the
    /// slot as a side effect, exactly as the spec's state machine
    /// requires (`Complete -> Free` happens here, on the hypervisor side).
    pub fn take_if_complete(&self) -> Option<DeviceModelRequest> {
        if self.valid.load(Ordering::Relaxed) == 0 {
            return None;
        }
        if self.processed.load(Ordering::Acquire) != COMPLETE {
            return None;
        }
        // SAFETY: processed == Complete, so the device model will not
        // touch the slot again until we store Free below.
        let result = unsafe { *self.request.get() };
        self.valid.store(0, Ordering::Relaxed);
        self.processed.store(FREE, Ordering::Release);
        Some(result)
    }

    /// Zombie short-circuit: free the slot without returning its contents.
    pub fn discard_if_complete(&self) -> bool {
        self.take_if_complete().is_some()
    }

    pub fn owner_vcpu(&self) -> u32 {
        unsafe { *self.owner_vcpu.get() }
    }
}

/// The shared ring: one slot per vCPU, indexed by vCPU id — the Rust
/// analogue of the spec's `io_shared_page` array.
pub struct SharedRing {
    slots: Vec<Slot>,
}

impl SharedRing {
    pub fn new(vcpu_count: usize) -> Self {
        Self {
            slots: (0..vcpu_count).map(|_| Slot::new()).collect(),
        }
    }

    pub fn slot(&self, vcpu_id: usize) -> &Slot {
        &self.slots[vcpu_id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::request::{Direction, PortPayload};
    use std::sync::atomic::AtomicUsize;

    struct CountingChannel {
        notified: AtomicUsize,
    }

    impl DeviceModelChannel for CountingChannel {
        fn notify_queued(&self, _vcpu_id: u32) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn full_round_trip() {
        let slot = Slot::new();
        let channel = CountingChannel {
            notified: AtomicUsize::new(0),
        };

        let req = IoRequest::PortIo(PortPayload {
            direction: Direction::Write,
            address: 0xcf8,
            size: 4,
            value: 0x8000_1000,
        });

        assert!(slot.take_if_complete().is_none());

        slot.insert_request_wait(0, &req, &channel);
        assert_eq!(channel.notified.load(Ordering::SeqCst), 1);

        // Device model side.
        slot.complete(0xdead_beef);

        let result = slot.take_if_complete().expect("slot should be complete");
        assert_eq!(result.value, 0xdead_beef);
        assert_eq!(result.address, 0xcf8);

        // Freed: re-reading returns None (spurious wake-up tolerance).
        assert!(slot.take_if_complete().is_none());
    }

    #[test]
    fn spurious_wakeup_is_a_no_op() {
        let slot = Slot::new();
        assert!(slot.take_if_complete().is_none());
    }

    #[test]
    fn zombie_short_circuit_discards_result() {
        let slot = Slot::new();
        let channel = CountingChannel {
            notified: AtomicUsize::new(0),
        };
        let req = IoRequest::Mmio(MmioPayload {
            direction: Direction::Read,
            address: 0xfee0_0020,
            size: 4,
            value: 0,
        });
        slot.insert_request_wait(1, &req, &channel);
        slot.complete(0xdead_beef);
        assert!(slot.discard_if_complete());
        assert!(slot.take_if_complete().is_none());
    }
}
