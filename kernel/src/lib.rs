//! Crux kernel library.
//!
//! A Plan 9 / L4 flavored microkernel core: physical and virtual memory
//! management, preemptive multi-core scheduling with work stealing,
//! synchronous channel IPC with deferred delivery, per-process
//! namespaces, and a fault supervisor. Drivers beyond serial, timer,
//! interrupt controller and keyboard live in userspace as file servers.
//!
//! The library also compiles for the host triple so unit tests of the
//! pure subsystems run under the standard harness.

#![no_std]
#![cfg_attr(
    all(target_arch = "x86_64", target_os = "none"),
    feature(abi_x86_interrupt)
)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

#[cfg(target_os = "none")]
extern crate alloc;

// Host target: link std so unit tests can allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod ipc;
pub mod klog;
pub mod mm;
pub mod process;
pub mod sched;
pub mod services;
pub mod sync;
mod syscall;
pub mod timer;

// The kernel heap arena is the global allocator on bare metal; host
// builds use the system allocator for tests.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelHeap = mm::heap::KernelHeap;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Heap allocation failure is unrecoverable in a no_std kernel; the
/// handler ABI requires divergence.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout);
}

/// Host-test support: the kernel's tables are global statics, so tests
/// that assert on their state serialize through this lock.
#[cfg(all(test, not(target_os = "none")))]
pub mod test_support {
    pub static GLOBAL_TABLES: std::sync::Mutex<()> = std::sync::Mutex::new(());
}
