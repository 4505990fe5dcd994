//! Virtual CPU management and execution.
//!
//! This module provides the vCPU abstraction for running guest code. A vCPU
//! represents a virtual processor that executes guest instructions using
//! hardware-assisted virtualization.
//!
//! # vCPU Execution Model
//!
//! The vCPU operates in a run loop:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      VMM (User Space)                   │
//! │  ┌─────────┐         ┌─────────────┐                   │
//! │  │  Loop   │◄────────│ Handle Exit │                   │
//! │  │  Start  │         │  (I/O, etc) │                   │
//! │  └────┬────┘         └──────▲──────┘                   │
//! │       │                     │                          │
//! │       │ vcpu.run()          │ VM Exit                  │
//! │       ▼                     │                          │
//! ├───────┼─────────────────────┼──────────────────────────┤
//! │       │      KVM (Kernel)   │                          │
//! │       │                     │                          │
//! │       ▼                     │                          │
//! │  ┌─────────┐          ┌─────┴─────┐                    │
//! │  │  VMXON  │─────────►│   VMEXIT  │                    │
//! │  │ /VMRUN  │  Guest   │           │                    │
//! │  └─────────┘  Runs    └───────────┘                    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # VM Exits
//!
//! When the guest performs certain operations, the CPU exits back to the VMM.
//! Common exit reasons include:
//!
//! - **I/O Port Access**: Guest used IN/OUT instructions
//! - **MMIO**: Guest accessed unmapped memory
//! - **HLT**: Guest executed HLT (halt until interrupt)
//! - **Shutdown**: Triple fault or explicit shutdown
//! - **External Interrupt**: Interrupt for the host
//!
//! # I/O Handling
//!
//! When the guest accesses an I/O port or an unmapped memory range, KVM
//! exits with the address, direction, size and (for writes) the data. This
//! module turns that exit straight into an [`crate::io::IoRequest`] and
//! hands it to a caller-supplied dispatcher — normalizing to the same type
//! the rest of the I/O pipeline (`crate::io`) already operates on, rather
//! than carrying a second, parallel "port data" representation.
//!
//! # CPU State
//!
//! The vCPU state includes:
//!
//! - **General registers**: RAX, RBX, RCX, RDX, RSI, RDI, RSP, RBP, R8-R15
//! - **Special registers**: CR0, CR3, CR4, EFER, segment registers
//! - **FPU/SSE state**: x87 registers, XMM registers, MXCSR
//! - **MSRs**: Model-specific registers (EFER, STAR, LSTAR, etc.)

use super::KvmError;
use crate::io::{Direction, IoOutcome, IoRequest, MmioPayload, PortPayload};
use kvm_bindings::{kvm_fpu, kvm_msr_entry, kvm_regs, kvm_sregs, Msrs};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

/// Model-Specific Register (MSR) indices.
///
/// MSRs are CPU registers that control various processor features and provide
/// system software with ways to configure CPU behavior. These particular MSRs
/// are required for Linux boot on x86_64.
mod msr {
    /// SYSENTER_CS - Code segment for SYSENTER instruction (32-bit syscalls).
    pub const IA32_SYSENTER_CS: u32 = 0x174;

    /// SYSENTER_ESP - Stack pointer for SYSENTER instruction.
    pub const IA32_SYSENTER_ESP: u32 = 0x175;

    /// SYSENTER_EIP - Instruction pointer for SYSENTER instruction.
    pub const IA32_SYSENTER_EIP: u32 = 0x176;

    /// STAR - Segment selectors for SYSCALL/SYSRET.
    pub const STAR: u32 = 0xc000_0081;

    /// LSTAR - Long mode SYSCALL target RIP.
    pub const LSTAR: u32 = 0xc000_0082;

    /// CSTAR - Compatibility mode SYSCALL target RIP.
    pub const CSTAR: u32 = 0xc000_0083;

    /// SYSCALL_MASK - RFLAGS mask for SYSCALL.
    pub const SYSCALL_MASK: u32 = 0xc000_0084;

    /// KERNEL_GS_BASE - Swap target for SWAPGS instruction.
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;

    /// TSC - Time Stamp Counter.
    pub const IA32_TSC: u32 = 0x10;

    /// MISC_ENABLE - Miscellaneous feature enables.
    pub const IA32_MISC_ENABLE: u32 = 0x1a0;

    /// MTRR default type - Memory Type Range Register default.
    pub const MTRR_DEF_TYPE: u32 = 0x2ff;

    /// Bit 0 of MISC_ENABLE: Fast string operations.
    pub const MISC_ENABLE_FAST_STRING: u64 = 1;
}

/// Wrapper around the KVM vCPU file descriptor.
///
/// Provides methods to:
/// - Get/set CPU registers (general, special, FPU)
/// - Configure MSRs for boot
/// - Run the vCPU and handle exits
pub struct VcpuFd {
    /// The underlying KVM vCPU file descriptor.
    vcpu: kvm_ioctls::VcpuFd,
}

/// Exit reasons from vCPU execution, once I/O traps have already been
/// routed through the dispatcher.
///
/// When `run_raw()` returns, it indicates why the guest stopped executing.
/// The VMM must handle the exit appropriately and typically call
/// `run_raw()` again to continue execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawVcpuExit {
    /// A port-I/O or MMIO trap was normalized into an `IoRequest` and run
    /// through the dispatcher. `Handled` means the access is complete and
    /// the vCPU can resume now; `Pending` means it was handed off to the
    /// device model and must stay parked until the completion wake-up.
    Io(IoOutcome),

    /// Guest executed HLT instruction.
    ///
    /// The CPU is waiting for an interrupt. The VMM can either:
    /// - Inject an interrupt and continue
    /// - Wait for an external event
    /// - Terminate if no more work to do
    Hlt,

    /// Guest requested shutdown.
    ///
    /// This happens on triple fault or explicit shutdown request.
    Shutdown,

    /// KVM internal error occurred.
    InternalError,

    /// Failed to enter guest mode.
    ///
    /// Contains the hardware-specific failure reason code.
    FailEntry(u64),

    /// System event (e.g., S3 sleep, reset).
    ///
    /// Contains the event type code.
    SystemEvent(u32),

    /// Unknown or unhandled exit reason.
    ///
    /// Contains a static description of the exit type.
    Unknown(&'static str),
}

impl VcpuFd {
    /// Create a new VcpuFd wrapper.
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }

    /// Get the current general-purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    /// Set the general-purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    /// Get the special registers.
    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    /// Set the special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    /// Set the FPU/SSE state.
    pub fn set_fpu(&self, fpu: &kvm_fpu) -> Result<(), KvmError> {
        self.vcpu.set_fpu(fpu).map_err(KvmError::SetRegisters)
    }

    /// Set up MSRs required for Linux boot.
    ///
    /// Configures Model-Specific Registers needed for 64-bit Linux:
    ///
    /// - **SYSENTER MSRs**: For 32-bit system calls (legacy, but expected)
    /// - **SYSCALL MSRs**: For 64-bit system calls (STAR, LSTAR, CSTAR, SYSCALL_MASK)
    /// - **KERNEL_GS_BASE**: For per-CPU data access via SWAPGS
    /// - **TSC**: Time Stamp Counter (initialized to 0)
    /// - **MISC_ENABLE**: Enable fast string operations
    /// - **MTRR_DEF_TYPE**: Set default memory type to write-back
    pub fn set_boot_msrs(&self) -> Result<(), KvmError> {
        let msr_entry = |index: u32, data: u64| kvm_msr_entry {
            index,
            data,
            ..Default::default()
        };

        let entries = vec![
            msr_entry(msr::IA32_SYSENTER_CS, 0),
            msr_entry(msr::IA32_SYSENTER_ESP, 0),
            msr_entry(msr::IA32_SYSENTER_EIP, 0),
            msr_entry(msr::STAR, 0),
            msr_entry(msr::CSTAR, 0),
            msr_entry(msr::KERNEL_GS_BASE, 0),
            msr_entry(msr::SYSCALL_MASK, 0),
            msr_entry(msr::LSTAR, 0),
            msr_entry(msr::IA32_TSC, 0),
            msr_entry(msr::IA32_MISC_ENABLE, msr::MISC_ENABLE_FAST_STRING),
            msr_entry(msr::MTRR_DEF_TYPE, (1 << 11) | 6),
        ];

        let msrs = Msrs::from_entries(&entries).expect("failed to create MSRs");
        self.vcpu.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;

        eprintln!("[KVM] Set {} boot MSRs", entries.len());
        Ok(())
    }

    /// Run the vCPU until it exits. Port-I/O and MMIO traps are normalized
    /// into an [`IoRequest`] and handed to `dispatch` (expected to wrap
    /// [`crate::io::VmIoState::emulate_io`]); its `Ok` result is folded
    /// back into KVM's exit buffers before returning, exactly as the raw
    /// hardware exit would have required the read response to be.
    ///
    /// This is the main execution loop entry point. It:
    /// 1. Enters guest mode (VMRESUME/VMRUN)
    /// 2. Executes guest code until a VM exit
    /// 3. For I/O exits, builds an `IoRequest`, dispatches it, and writes
    ///    any read result back into KVM's exit buffer
    /// 4. Returns with the exit reason
    ///
    /// `vcpu_id` is passed through to `dispatch` unchanged; this module has
    /// no notion of vCPU identity beyond the underlying file descriptor.
    pub fn run_raw(
        &mut self,
        vcpu_id: usize,
        dispatch: &mut dyn FnMut(usize, &mut IoRequest) -> Result<IoOutcome, KvmError>,
    ) -> Result<RawVcpuExit, KvmError> {
        match self.vcpu.run().map_err(KvmError::Run)? {
            KvmVcpuExit::IoIn(port, data) => {
                let mut req = IoRequest::PortIo(PortPayload {
                    direction: Direction::Read,
                    address: port as u64,
                    size: data.len() as u8,
                    value: 0,
                });
                let outcome = dispatch(vcpu_id, &mut req)?;
                if outcome == IoOutcome::Handled {
                    let bytes = req.value().to_le_bytes();
                    data.copy_from_slice(&bytes[..data.len()]);
                }
                Ok(RawVcpuExit::Io(outcome))
            }

            KvmVcpuExit::IoOut(port, data) => {
                let mut req = IoRequest::PortIo(PortPayload {
                    direction: Direction::Write,
                    address: port as u64,
                    size: data.len() as u8,
                    value: bytes_to_value(data),
                });
                let outcome = dispatch(vcpu_id, &mut req)?;
                Ok(RawVcpuExit::Io(outcome))
            }

            KvmVcpuExit::MmioRead(addr, data) => {
                let mut req = IoRequest::Mmio(MmioPayload {
                    direction: Direction::Read,
                    address: addr,
                    size: data.len() as u8,
                    value: 0,
                });
                let outcome = dispatch(vcpu_id, &mut req)?;
                if outcome == IoOutcome::Handled {
                    let bytes = req.value().to_le_bytes();
                    data.copy_from_slice(&bytes[..data.len()]);
                }
                Ok(RawVcpuExit::Io(outcome))
            }

            KvmVcpuExit::MmioWrite(addr, data) => {
                let mut req = IoRequest::Mmio(MmioPayload {
                    direction: Direction::Write,
                    address: addr,
                    size: data.len() as u8,
                    value: bytes_to_value(data),
                });
                let outcome = dispatch(vcpu_id, &mut req)?;
                Ok(RawVcpuExit::Io(outcome))
            }

            KvmVcpuExit::Hlt => Ok(RawVcpuExit::Hlt),
            KvmVcpuExit::Shutdown => Ok(RawVcpuExit::Shutdown),
            KvmVcpuExit::InternalError => Ok(RawVcpuExit::InternalError),
            KvmVcpuExit::SystemEvent(event, _) => Ok(RawVcpuExit::SystemEvent(event)),
            KvmVcpuExit::FailEntry(reason, _) => Ok(RawVcpuExit::FailEntry(reason)),

            // Map known exits to static strings
            KvmVcpuExit::Hypercall(_) => Ok(RawVcpuExit::Unknown("Hypercall")),
            KvmVcpuExit::Debug(_) => Ok(RawVcpuExit::Unknown("Debug")),
            KvmVcpuExit::Exception => Ok(RawVcpuExit::Unknown("Exception")),
            KvmVcpuExit::IrqWindowOpen => Ok(RawVcpuExit::Unknown("IrqWindowOpen")),
            KvmVcpuExit::S390Sieic => Ok(RawVcpuExit::Unknown("S390Sieic")),
            KvmVcpuExit::S390Reset => Ok(RawVcpuExit::Unknown("S390Reset")),
            KvmVcpuExit::Dcr => Ok(RawVcpuExit::Unknown("Dcr")),
            KvmVcpuExit::Nmi => Ok(RawVcpuExit::Unknown("Nmi")),
            KvmVcpuExit::Watchdog => Ok(RawVcpuExit::Unknown("Watchdog")),
            KvmVcpuExit::Epr => Ok(RawVcpuExit::Unknown("Epr")),
            _ => Ok(RawVcpuExit::Unknown("Other")),
        }
    }
}

fn bytes_to_value(data: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, b) in data.iter().enumerate() {
        value |= (*b as u64) << (8 * i);
    }
    value
}
