//! riscv64 support (Sv48, single hart).
//!
//! The secondary architecture: one hart, SBI for console/timer/reset,
//! traps through `trap.rs`. Cross-core operations (IPIs, remote TLB
//! shootdown) are no-ops -- `cores_ran_on` only ever names this hart.

pub mod sbi;
pub mod trap;

use riscv::register::{satp, sstatus};

pub fn init() {
    trap::init();
    crate::sched::bring_online(0);
    // User-memory access from S-mode (copy_to/from_space goes through
    // the direct map instead, but the syscall entry reads user frames).
    // SAFETY: standard SUM enable.
    unsafe { sstatus::set_sum() };
}

pub fn cpu_id() -> usize {
    0
}

pub fn debug_write_str(s: &str) {
    for b in s.bytes() {
        sbi::console_putchar(b);
    }
}

pub fn debug_write_bytes(bytes: &[u8]) {
    for &b in bytes {
        sbi::console_putchar(b);
    }
}

/// Initial sstatus for a fresh user thread: SPIE (interrupts on after
/// sret) and SUM.
pub fn initial_user_flags() -> u64 {
    (1 << 5) | (1 << 18)
}

/// riscv has no return-address slot convention; SP starts at the top.
pub fn initial_user_sp() -> u64 {
    crate::mm::layout::USER_STACK_TOP
}

/// Physical address of the active top-level table.
pub fn current_root() -> u64 {
    (satp::read().ppn() as u64) << 12
}

pub fn load_root(root: u64) {
    // SAFETY: `root` is a valid top-level table with the kernel half
    // mapped; Sv48 mode with ASID 0.
    unsafe { satp::set(satp::Mode::Sv48, 0, (root >> 12) as usize) };
    flush_tlb_local();
}

pub fn flush_tlb_local() {
    // SAFETY: full local fence.
    unsafe { core::arch::asm!("sfence.vma") };
}

// Single hart: nothing to kick.
pub fn send_schedule_ipi(_core: usize) {}

pub fn send_tlb_ipi(_core: usize) {}

/// tp carries the TLS base in the riscv ABI; restored on each switch.
pub fn set_fs_base(base: u64) {
    // SAFETY: plain register write; the kernel does not use tp itself.
    unsafe { core::arch::asm!("mv tp, {}", in(reg) base) };
}

pub fn prepare_kernel_entry(kstack_top: u64) {
    trap::set_kernel_stack(kstack_top);
}

/// Idle until an interrupt is pending. S-mode keeps SIE masked (wfi
/// wakes on a pending interrupt regardless), so kernel code never traps
/// on interrupts; pending causes are serviced here by polling.
pub fn wait_for_interrupt() {
    riscv::asm::wfi();
    trap::poll_pending();
}

pub fn enter_user(ip: u64, sp: u64, flags: u64) -> ! {
    trap::enter_user(ip, sp, flags)
}

pub fn resume_from_kernel_frame(ksp: u64, ret: u64) -> ! {
    trap::resume_from_kernel_frame(ksp, ret)
}

pub fn switch_stack_and_run(stack_top: u64, f: extern "C" fn() -> !) -> ! {
    // SAFETY: the per-core scheduler stack is exclusively ours and `f`
    // never returns.
    unsafe { trap::switch_stack_and_run(stack_top, f) }
}

pub fn halt_forever() -> ! {
    loop {
        riscv::asm::wfi();
    }
}

pub fn shutdown(reboot: bool) -> ! {
    sbi::system_reset(reboot);
    halt_forever()
}
