//! x86_64 support: GDT/IDT, COM1, SYSCALL plumbing, LAPIC IPIs.

pub mod gdt;
pub mod idt;
pub mod ipi;
pub mod serial;
pub mod syscall;
pub mod usermode;

use x86_64::{
    instructions::{hlt, interrupts},
    registers::{
        control::{Cr3, Cr3Flags},
        model_specific::{FsBase, GsBase, KernelGsBase},
    },
    structures::paging::PhysFrame,
    PhysAddr, VirtAddr,
};

/// Bring up the BSP's architecture state. Interrupts stay disabled; the
/// scheduler's idle loop is the only place they are enabled.
pub fn init() {
    gdt::init();
    idt::init();
    syscall::init();
    install_percpu(0);
}

/// Point GS (and the syscall swapgs partner MSR) at `core`'s asm slot
/// block.
pub fn install_percpu(core: usize) {
    let cpu = crate::sched::bring_online(core);
    let slots = VirtAddr::new(cpu.asm.get() as u64);
    GsBase::write(slots);
    KernelGsBase::write(slots);
}

/// This core's id, from the per-cpu slot block; 0 before `install_percpu`.
pub fn cpu_id() -> usize {
    let base = GsBase::read();
    if base.as_u64() == 0 {
        return 0;
    }
    // SAFETY: GS base, once installed, always points at a live AsmSlots
    // whose cpu_id field sits at offset 0x28.
    unsafe { ((base.as_u64() + 0x28) as *const u64).read_volatile() as usize }
}

pub fn debug_write_str(s: &str) {
    serial::write_str(s);
}

pub fn debug_write_bytes(b: &[u8]) {
    serial::write_bytes(b);
}

/// Initial RFLAGS for a fresh user thread: IF set.
pub fn initial_user_flags() -> u64 {
    0x202
}

/// Initial user SP: the ABI expects a return-address slot.
pub fn initial_user_sp() -> u64 {
    crate::mm::layout::USER_STACK_TOP - 8
}

/// Physical address of the active top-level table.
pub fn current_root() -> u64 {
    Cr3::read().0.start_address().as_u64()
}

/// Load CR3 with `root`.
pub fn load_root(root: u64) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root));
    if Cr3::read().0 != frame {
        // SAFETY: `root` is a valid top-level table built by mm::paging,
        // with the kernel half (including this code) always mapped.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
}

/// Flush this core's entire TLB by reloading CR3.
pub fn flush_tlb_local() {
    let (frame, flags) = Cr3::read();
    // SAFETY: rewriting the current root is always valid.
    unsafe { Cr3::write(frame, flags) };
}

pub fn send_schedule_ipi(core: usize) {
    ipi::send(core, idt::SCHEDULE_IPI_VECTOR);
}

pub fn send_tlb_ipi(core: usize) {
    ipi::send(core, idt::TLB_IPI_VECTOR);
}

/// Per-thread TLS base.
pub fn set_fs_base(base: u64) {
    FsBase::write(VirtAddr::new(base));
}

/// Tell the CPU where ring-3 interrupts should land.
pub fn prepare_kernel_entry(kstack_top: u64) {
    gdt::set_kernel_interrupt_stack(kstack_top);
}

/// Idle: enable interrupts, halt until one arrives, disable again.
pub fn wait_for_interrupt() {
    interrupts::enable_and_hlt();
    interrupts::disable();
}

/// First return to ring 3.
pub fn enter_user(ip: u64, sp: u64, flags: u64) -> ! {
    // SAFETY: the scheduler passes a mapped user ip/sp in the active
    // space and flags with IF set.
    unsafe { usermode::enter_user(ip, sp, flags) }
}

/// Resume a blocked syscall; see `syscall::resume_from_kernel_frame`.
pub fn resume_from_kernel_frame(ksp: u64, ret: u64) -> ! {
    syscall::resume_from_kernel_frame(ksp, ret)
}

/// Run `f` on `stack_top`; the scheduler's stack pivot.
pub fn switch_stack_and_run(stack_top: u64, f: extern "C" fn() -> !) -> ! {
    // SAFETY: the per-core scheduler stack is exclusively this core's,
    // and `f` (the scheduler loop) never returns.
    unsafe { usermode::switch_stack_and_run(stack_top, f) }
}

/// Halt this core permanently.
pub fn halt_forever() -> ! {
    interrupts::disable();
    loop {
        hlt();
    }
}

/// Power off (QEMU ACPI PM) or reboot (keyboard controller pulse).
pub fn shutdown(reboot: bool) -> ! {
    use x86_64::instructions::port::Port;
    interrupts::disable();
    // SAFETY: firmware-defined port writes; on real failure we fall
    // through to a halt loop.
    unsafe {
        if reboot {
            Port::<u8>::new(0x64).write(0xFEu8);
        } else {
            Port::<u16>::new(0x604).write(0x2000u16);
        }
    }
    halt_forever()
}
