//! Cross-CPU notification: a broadcast-one-callback-to-a-mask primitive
//! built on a single reserved signal, used to kick a physical CPU out of
//! guest mode so it can service a queued I/O completion.
//!
//! On real hardware a type-1 hypervisor reserves an interrupt vector and
//! sends a logical-destination IPI. This VMM is userspace KVM, so "physical
//! CPU" is realized as a host thread pinned to one vCPU, and the "IPI" is
//! realized as `pthread_kill` with a dedicated signal: delivering it
//! interrupts a blocking `KVM_RUN` with `EINTR` without killing the
//! thread, the same trick other KVM-based monitors use to break a vCPU
//! thread out of guest mode for a control operation. The broadcast
//! contract — exactly-once delivery per targeted CPU, issuer observes all
//! completions before returning, broadcasts serialize system-wide — is
//! unchanged from the spec; only the delivery mechanism is userspace-native.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// The signal used to kick a pCPU thread out of `KVM_RUN`. Chosen to match
/// the convention (a dedicated, otherwise-unused signal with a no-op
/// handler installed once) used elsewhere for this exact purpose.
const NOTIFY_SIGNAL: libc::c_int = libc::SIGUSR1;

/// Bit reserved as an "invalid CPU" sentinel; `smp_call_function` clears it
/// from the caller's mask before doing anything else.
const INVALID_CPU_BIT: u64 = 1 << 63;

/// Maximum number of physical CPUs this engine can address (one bit per
/// CPU in a `u64` mask, minus the sentinel bit).
pub const MAX_CPUS: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SmpError {
    #[error("notification already set up")]
    Busy,
}

/// A set of physical CPU ids, stored as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    pub fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub fn single(cpu: usize) -> Self {
        Self(1u64 << cpu)
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < 64 && self.0 & (1 << cpu) != 0
    }

    fn clear(&mut self, cpu: usize) {
        if cpu < 64 {
            self.0 &= !(1u64 << cpu);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64).filter(move |&c| self.contains(c))
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Per-pCPU bookkeeping: whether the CPU is active, its thread handle (for
/// signal delivery), and its call slot (populated by the issuer before the
/// IPI, cleared by the callee on consumption).
struct PerCpu {
    active: AtomicBool,
    thread: Mutex<Option<libc::pthread_t>>,
    call_slot: Mutex<Option<Callback>>,
}

impl Default for PerCpu {
    fn default() -> Self {
        Self {
            active: AtomicBool::new(false),
            thread: Mutex::new(None),
            call_slot: Mutex::new(None),
        }
    }
}

thread_local! {
    /// Reentrancy guard: `smp_call_function` must not be called
    /// recursively from within its own callback or busy-wait.
    static IN_SMP_CALL: Cell<bool> = const { Cell::new(false) };
}

struct ReentrancyGuard;

impl ReentrancyGuard {
    fn enter() -> Self {
        IN_SMP_CALL.with(|f| {
            assert!(!f.get(), "smp_call_function called recursively");
            f.set(true);
        });
        Self
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        IN_SMP_CALL.with(|f| f.set(false));
    }
}

/// The cross-CPU notification engine: one global call mask (the coarse
/// lock serializing all broadcasts system-wide) plus one slot per pCPU.
pub struct SmpCallEngine {
    cpus: Vec<PerCpu>,
    call_mask: AtomicU64,
    notify_registered: AtomicBool,
}

impl SmpCallEngine {
    pub fn new(cpu_count: usize) -> Self {
        assert!(cpu_count <= MAX_CPUS);
        Self {
            cpus: (0..cpu_count).map(|_| PerCpu::default()).collect(),
            call_mask: AtomicU64::new(0),
            notify_registered: AtomicBool::new(false),
        }
    }

    /// `setup_notification`: register the kick ISR exactly once,
    /// system-wide. Only the bootstrap CPU is expected to call this;
    /// a second call — from CPU 0 or anyone else — is `Busy`.
    pub fn setup_notification(&self) -> Result<(), SmpError> {
        if self.notify_registered.swap(true, Ordering::AcqRel) {
            return Err(SmpError::Busy);
        }
        install_kick_handler();
        Ok(())
    }

    /// Registers a pCPU as active and records the host thread that should
    /// receive its kicks. Called once when the pCPU's worker thread starts.
    pub fn register_cpu(&self, cpu_id: usize, thread: libc::pthread_t) {
        *self.cpus[cpu_id].thread.lock().unwrap() = Some(thread);
        self.cpus[cpu_id].active.store(true, Ordering::Release);
    }

    /// Marks a pCPU inactive (e.g. its worker thread is exiting). An
    /// inactive CPU is dropped from any in-flight broadcast's mask instead
    /// of being waited on forever.
    pub fn deactivate_cpu(&self, cpu_id: usize) {
        self.cpus[cpu_id].active.store(false, Ordering::Release);
    }

    fn is_active(&self, cpu_id: usize) -> bool {
        cpu_id < self.cpus.len() && self.cpus[cpu_id].active.load(Ordering::Acquire)
    }

    /// `smp_call_function`: run `f` exactly once on every active CPU in
    /// `mask`, synchronously. Must not be called from the kick path
    /// itself, nor recursively, nor with the calling CPU's own kicks
    /// masked off while it is itself a target (the engine has no way to
    /// enforce the latter two system-level preconditions beyond the
    /// reentrancy guard below; they are the caller's responsibility, as
    /// in the source design).
    pub fn smp_call_function<F>(&self, mut mask: CpuMask, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let _guard = ReentrancyGuard::enter();
        let callback: Callback = Arc::new(f);

        // 1. Sanitize: clear the sentinel "invalid CPU" bit.
        mask = CpuMask::new(mask.bits() & !INVALID_CPU_BIT);

        // 2. Claim the global mask via CAS from 0; spin until it succeeds.
        // This serializes every broadcast system-wide.
        while self
            .call_mask
            .compare_exchange_weak(0, mask.bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
        }

        // 3. Populate each active target's slot; drop absent CPUs from the
        // mask (they cannot acknowledge a callback that never reaches
        // them).
        let mut reduced = mask;
        for cpu in mask.iter() {
            if cpu >= self.cpus.len() || !self.is_active(cpu) {
                reduced.clear(cpu);
                self.call_mask.fetch_and(!(1u64 << cpu), Ordering::AcqRel);
                eprintln!("[SMP] cpu {cpu} absent from active set, dropped from broadcast");
                continue;
            }
            *self.cpus[cpu].call_slot.lock().unwrap() = Some(Arc::clone(&callback));
        }

        // 4. Send the notification IPI to every CPU still in the reduced
        // mask.
        for cpu in reduced.iter() {
            let thread = *self.cpus[cpu].thread.lock().unwrap();
            if let Some(thread) = thread {
                unsafe {
                    libc::pthread_kill(thread, NOTIFY_SIGNAL);
                }
            }
        }

        // 5. Wait for every targeted CPU to clear its bit.
        while self.call_mask.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
    }

    /// `kick_notification`: the receiving CPU's half of the protocol. A
    /// pCPU worker thread calls this after its `KVM_RUN` is interrupted by
    /// `EINTR`. If its own bit is set, it runs the pending callback and
    /// clears the bit; otherwise the interruption was a pure "kick" (used
    /// to force re-entry to the host from guest mode) and no callback runs.
    pub fn kick_notification(&self, cpu_id: usize) {
        let bit = 1u64 << cpu_id;
        if self.call_mask.load(Ordering::Acquire) & bit == 0 {
            return;
        }
        let callback = self.cpus[cpu_id].call_slot.lock().unwrap().take();
        if let Some(f) = callback {
            f();
        }
        self.call_mask.fetch_and(!bit, Ordering::AcqRel);
    }
}

/// Installs a no-op handler for [`NOTIFY_SIGNAL`] so `pthread_kill`
/// interrupts a blocking `KVM_RUN` with `EINTR` instead of the default
/// disposition (which would terminate the process).
fn install_kick_handler() {
    extern "C" fn handle_kick(_signum: libc::c_int) {}

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_kick as usize;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(NOTIFY_SIGNAL, &sa, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn cpu_mask_sanitizes_sentinel_bit() {
        let engine = SmpCallEngine::new(2);
        engine.register_cpu(0, unsafe { libc::pthread_self() });
        engine.register_cpu(1, unsafe { libc::pthread_self() });

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        engine.smp_call_function(CpuMask::new(0x1 | INVALID_CPU_BIT), move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(engine.call_mask.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn broadcast_runs_on_every_active_target() {
        let engine = Arc::new(SmpCallEngine::new(3));
        // Worker threads for cpu 1 and 2: park, then service one kick.
        let mut handles = Vec::new();
        let ran = Arc::new(AtomicUsize::new(0));

        for cpu in [1usize, 2usize] {
            let engine = Arc::clone(&engine);
            let ran = Arc::clone(&ran);
            handles.push(thread::spawn(move || {
                engine.register_cpu(cpu, unsafe { libc::pthread_self() });
                // Busy-wait for our bit to be set, simulating the worker
                // loop noticing its kick after EINTR from KVM_RUN.
                while engine.call_mask.load(Ordering::Acquire) & (1 << cpu) == 0 {
                    std::hint::spin_loop();
                }
                engine.kick_notification(cpu);
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Give the worker threads a moment to register.
        while engine.cpus.len() < 3
            || !engine.is_active(1)
            || !engine.is_active(2)
        {
            std::hint::spin_loop();
        }

        engine.smp_call_function(CpuMask::new(0b110), || {});

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(engine.call_mask.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn absent_cpu_is_dropped_from_mask_not_waited_on() {
        let engine = SmpCallEngine::new(2);
        engine.register_cpu(0, unsafe { libc::pthread_self() });
        // cpu 1 never registered/active.
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        engine.smp_call_function(CpuMask::new(0b11), move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn setup_notification_is_once_only() {
        let engine = SmpCallEngine::new(1);
        assert!(engine.setup_notification().is_ok());
        assert_eq!(engine.setup_notification(), Err(SmpError::Busy));
    }

    #[test]
    #[should_panic(expected = "recursively")]
    fn recursive_call_panics() {
        let engine = SmpCallEngine::new(1);
        engine.register_cpu(0, unsafe { libc::pthread_self() });
        engine.smp_call_function(CpuMask::single(0), || {});
        // Simulate a nested call from within a callback by invoking the
        // guard machinery directly (calling from inside the closure above
        // would deadlock on the real mask CAS instead of panicking, since
        // the first call already completed by the time the closure runs).
        let _outer = ReentrancyGuard::enter();
        engine.smp_call_function(CpuMask::single(0), || {});
    }
}
