//! Carbon - A minimal microVM runtime for AI agent sandboxing.
//!
//! Milestone 2: Boot Linux with virtio-blk disk support, driven through the
//! shared guest I/O emulation core (`hvio`) instead of a single-purpose
//! device dispatcher.
//!
//! This VMM requires Linux with KVM support. It will not run on other platforms.

#[cfg(target_os = "linux")]
use hvio::{boot, devices, hypervisor, io, kvm, smp};

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "carbon")]
#[command(about = "A minimal microVM runtime for AI agent sandboxing")]
struct Args {
    /// Path to the Linux kernel bzImage
    #[arg(short, long)]
    kernel: String,

    /// Kernel command line (fast-boot options added automatically)
    #[arg(short, long, default_value = "console=ttyS0")]
    cmdline: String,

    /// Memory size in megabytes
    #[arg(short, long, default_value = "512")]
    memory: u64,

    /// Path to raw disk image (enables virtio-blk device)
    #[arg(short, long)]
    disk: Option<String>,

    /// Number of worker pCPUs to spin up for the cross-CPU notification
    /// demo. This is separate from the boot vCPU: Carbon boots a single
    /// guest vCPU, and these are plain host threads exercising the SMP-call
    /// broadcast primitive (`smp::SmpCallEngine`) outside the guest.
    #[arg(long, default_value = "3")]
    smp_demo_cpus: usize,

    /// Run the guest's I/O slice in "privileged" mode: registered PIO
    /// ranges are trapped in the bitmap (rather than the default
    /// pass-through) and registered MMIO ranges are unmapped from the
    /// identity EPT view.
    #[arg(long)]
    privileged: bool,

    /// Run with no device-model companion: unclaimed I/O synthesizes
    /// all-ones locally instead of handing off to the bridge.
    #[arg(long)]
    partitioned: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use boot::{BootConfig, GuestMemory, VirtioDeviceConfig};
    use devices::{
        Cmos, Serial, VirtioBlk, CMOS_PORT_INDEX, SERIAL_COM1_BASE, VIRTIO_BLK_IRQ,
        VIRTIO_MMIO_BASE, VIRTIO_MMIO_SIZE,
    };
    use hypervisor::ExitReason;
    use io::{DeviceModelChannel, EptUnmap, IoMode, VmIoState};

    eprintln!("[VMM] Carbon starting...");
    eprintln!("[VMM] Kernel: {}", args.kernel);
    eprintln!("[VMM] Memory: {} MB", args.memory);
    if let Some(ref disk) = args.disk {
        eprintln!("[VMM] Disk: {}", disk);
    }

    // Create VM
    let vm = kvm::create_vm()?;

    // Allocate guest memory
    let mem_size = args.memory * 1024 * 1024;
    let memory = GuestMemory::new(mem_size)?;

    // Build kernel command line
    // Note: virtio devices are discovered via ACPI, not kernel command line
    let mut cmdline_parts = vec![args.cmdline.clone()];
    cmdline_parts.push("reboot=t".into());
    cmdline_parts.push("panic=-1".into());
    cmdline_parts.push("noapictimer".into());
    let cmdline = cmdline_parts.join(" ");
    eprintln!("[VMM] Cmdline: {}", cmdline);

    // Build virtio device configuration for ACPI DSDT
    let mut virtio_devices = Vec::new();
    if args.disk.is_some() {
        virtio_devices.push(VirtioDeviceConfig {
            id: 0,
            mmio_base: VIRTIO_MMIO_BASE,
            mmio_size: VIRTIO_MMIO_SIZE as u32,
            gsi: VIRTIO_BLK_IRQ,
        });
    }

    // Set up ACPI tables with HW_REDUCED flag and virtio device definitions
    boot::setup_acpi(&memory, 1, &virtio_devices)?;

    // Set up MP tables for interrupt routing (used with HW_REDUCED ACPI)
    boot::setup_mptable(&memory, 1)?;

    // Set up boot using Linux 64-bit boot protocol
    let config = BootConfig {
        kernel_path: args.kernel.clone(),
        cmdline,
        mem_size,
    };
    boot::setup_boot(&vm, &memory, &config)?;

    // The I/O slice: handler tables, trap bitmap, bridge ring. One entry
    // per guest vCPU; Carbon boots exactly one.
    let io_mode = if args.partitioned {
        IoMode::Partitioned
    } else {
        IoMode::Normal
    };
    let mut io_state = VmIoState::new(args.privileged, io_mode, 1);

    io_state.register_pio_handler(SERIAL_COM1_BASE, 8, Box::new(Serial::new()));
    io_state.register_pio_handler(CMOS_PORT_INDEX, 2, Box::new(Cmos::new()));

    struct NullEpt;
    impl EptUnmap for NullEpt {
        fn unmap_identity(&mut self, start: u64, end: u64) {
            eprintln!("[VMM] (no-op) unmap identity EPT range {start:#x}..{end:#x}");
        }
    }
    let mut ept = NullEpt;

    // Create virtio-blk device after memory is set up
    if let Some(ref disk_path) = args.disk {
        let mut blk = VirtioBlk::new(disk_path)?;
        blk.set_memory(&memory);
        io_state.register_mmio_handler(
            VIRTIO_MMIO_BASE,
            VIRTIO_MMIO_BASE + VIRTIO_MMIO_SIZE,
            Box::new(blk),
            &mut ept,
        );
        eprintln!("[VMM] virtio-blk registered at {:#x}", VIRTIO_MMIO_BASE);
    }
    io_state.mark_launched();

    struct LoggingChannel;
    impl DeviceModelChannel for LoggingChannel {
        fn notify_queued(&self, vcpu_id: u32) {
            eprintln!("[IO] vcpu {vcpu_id}: request queued for device model");
        }
    }
    let channel = LoggingChannel;

    // Create vCPU (also sets CPUID)
    let mut vcpu = vm.create_vcpu(0)?;

    // Set up CPU registers for 64-bit long mode boot
    vcpu.set_boot_msrs()?;
    boot::setup_vcpu_regs(&vcpu, &memory)?;

    eprintln!("[VMM] Starting vCPU...");
    use std::io::Write;
    std::io::stderr().flush().ok();

    let reason = hypervisor::run_vcpu(&mut vcpu, 0, &mut io_state, &channel, &[])?;
    match reason {
        ExitReason::Halted => eprintln!("\n[VMM] Guest halted"),
        ExitReason::ShutDown => {
            eprintln!("\n[VMM] Guest shutdown");
            if let Ok(regs) = vcpu.get_regs() {
                eprintln!("[VMM] Final RIP: {:#x}", regs.rip);
            }
        }
        ExitReason::InternalError => eprintln!("[VMM] KVM internal error"),
        ExitReason::FailEntry(code) => eprintln!("[VMM] Failed to enter guest: reason={code}"),
        ExitReason::SystemEvent(event) => eprintln!("[VMM] System event: {event}"),
        ExitReason::Unknown(reason) => eprintln!("[VMM] Unknown exit: {reason}"),
    }

    if args.smp_demo_cpus > 0 {
        run_smp_demo(args.smp_demo_cpus);
    }

    Ok(())
}

/// Demonstrates the cross-CPU notification primitive against plain host
/// threads standing in for physical CPUs. This is independent of the guest
/// vCPU above — the boot path never broadcasts an SMP call on its own; this
/// is wiring a VHM-style "wake every pCPU servicing a completion" broadcast
/// would ride on, shown in isolation since this VMM boots a single vCPU.
#[cfg(target_os = "linux")]
fn run_smp_demo(worker_count: usize) {
    use smp::{CpuMask, SmpCallEngine};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    eprintln!("[SMP] starting cross-CPU notification demo with {worker_count} pCPUs");

    let engine = Arc::new(SmpCallEngine::new(worker_count));
    engine.setup_notification().expect("first setup call");

    let ran = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(worker_count);
    for cpu in 0..worker_count {
        let engine = Arc::clone(&engine);
        let ran = Arc::clone(&ran);
        handles.push(thread::spawn(move || {
            engine.register_cpu(cpu, unsafe { libc::pthread_self() });
            // Stand-in for a pCPU worker loop noticing its kick after
            // EINTR from a blocking KVM_RUN: poll until every target has
            // serviced the broadcast (the shared callback below bumps
            // `ran`, so this is also our own completion signal).
            while ran.load(Ordering::Acquire) < worker_count {
                engine.kick_notification(cpu);
                std::hint::spin_loop();
            }
            engine.deactivate_cpu(cpu);
        }));
    }

    // Give worker threads a moment to register before broadcasting.
    std::thread::sleep(std::time::Duration::from_millis(5));

    let mask = CpuMask::new((1u64 << worker_count) - 1);
    let ran_in_callback = Arc::clone(&ran);
    engine.smp_call_function(mask, move || {
        ran_in_callback.fetch_add(1, Ordering::SeqCst);
    });

    for h in handles {
        let _ = h.join();
    }

    eprintln!(
        "[SMP] demo complete: {}/{worker_count} pCPUs ran the broadcast callback",
        ran.load(Ordering::SeqCst)
    );
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("Carbon requires Linux with KVM support. This platform is not supported.".into())
}
