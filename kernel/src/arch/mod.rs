//! Architecture abstraction.
//!
//! The kernel proper calls only the functions re-exported here; each
//! architecture provides them plus its own entry/trap plumbing. Host
//! builds (unit tests) get inert stubs so the pure subsystems can be
//! exercised under the standard test harness.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use x86_64 as imp;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod riscv64;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use riscv64 as imp;

#[cfg(not(target_os = "none"))]
mod host;
#[cfg(not(target_os = "none"))]
use host as imp;

pub use imp::{
    cpu_id, current_root, debug_write_bytes, debug_write_str, enter_user, flush_tlb_local,
    halt_forever, initial_user_flags, initial_user_sp, load_root, prepare_kernel_entry,
    resume_from_kernel_frame, send_schedule_ipi, send_tlb_ipi, set_fs_base, shutdown,
    switch_stack_and_run, wait_for_interrupt,
};

#[cfg(target_os = "none")]
pub use imp::init;
