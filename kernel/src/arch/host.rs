//! Inert arch stubs for host-side unit tests. Nothing here runs kernel
//! control flow; functions that would transfer control panic instead.

pub fn cpu_id() -> usize {
    0
}

pub fn debug_write_str(_s: &str) {}

pub fn debug_write_bytes(_b: &[u8]) {}

pub fn initial_user_flags() -> u64 {
    0x202
}

pub fn initial_user_sp() -> u64 {
    crate::mm::layout::USER_STACK_TOP - 8
}

pub fn load_root(_root: u64) {}

pub fn current_root() -> u64 {
    0
}

pub fn flush_tlb_local() {}

pub fn send_schedule_ipi(_core: usize) {}

pub fn send_tlb_ipi(_core: usize) {}

pub fn set_fs_base(_base: u64) {}

pub fn prepare_kernel_entry(_kstack_top: u64) {}

pub fn wait_for_interrupt() {}

pub fn enter_user(_ip: u64, _sp: u64, _flags: u64) -> ! {
    unreachable!("host stub: no user mode")
}

pub fn resume_from_kernel_frame(_ksp: u64, _ret: u64) -> ! {
    unreachable!("host stub: no kernel frames")
}

pub fn switch_stack_and_run(_stack_top: u64, _f: extern "C" fn() -> !) -> ! {
    unreachable!("host stub: no scheduler stacks")
}

pub fn halt_forever() -> ! {
    unreachable!("host stub: no halt")
}

pub fn shutdown(_reboot: bool) -> ! {
    unreachable!("host stub: no shutdown")
}
