//! Guest I/O emulation core for a KVM-based microVM monitor.
//!
//! [`io`] and [`smp`] are platform-independent: they operate on
//! [`io::IoRequest`] values and opaque handler traits, and are exercised by
//! their own unit tests without `/dev/kvm`. [`kvm`], [`devices`], [`boot`]
//! and [`hypervisor`] are the concrete Linux/KVM collaborators that drive
//! them against a real guest.

pub mod io;
pub mod smp;

#[cfg(target_os = "linux")]
pub mod boot;
#[cfg(target_os = "linux")]
pub mod devices;
#[cfg(target_os = "linux")]
pub mod hypervisor;
#[cfg(target_os = "linux")]
pub mod kvm;
