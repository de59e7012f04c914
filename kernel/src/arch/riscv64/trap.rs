//! Trap entry, syscall dispatch, and the sret resume paths.
//!
//! `sscratch` discipline: while a thread runs in U-mode, sscratch holds
//! its kernel stack top; while in S-mode it is zero, which is how the
//! entry stub tells kernel traps from user traps.

use core::sync::atomic::{AtomicU64, Ordering};

use riscv::register::{scause, sie, stval, stvec};

use crate::{process::table, sched};

/// Timer interval: QEMU's 10 MHz timebase at the shared ~18 Hz tick.
const TIMER_INTERVAL: u64 = 10_000_000 / crate::timer::TICK_HZ;

/// Trap frame, in store order from the entry stub. `a0` doubles as the
/// syscall return value slot.
#[repr(C)]
pub struct TrapFrame {
    pub ra: u64,       // 0x00
    pub gp: u64,       // 0x08
    pub tp: u64,       // 0x10
    pub t0: u64,       // 0x18
    pub t1: u64,       // 0x20
    pub t2: u64,       // 0x28
    pub s0: u64,       // 0x30
    pub s1: u64,       // 0x38
    pub a0: u64,       // 0x40
    pub a1: u64,       // 0x48
    pub a2: u64,       // 0x50
    pub a3: u64,       // 0x58
    pub a4: u64,       // 0x60
    pub a5: u64,       // 0x68
    pub a6: u64,       // 0x70
    pub a7: u64,       // 0x78
    pub s2: u64,       // 0x80
    pub s3: u64,       // 0x88
    pub s4: u64,       // 0x90
    pub s5: u64,       // 0x98
    pub s6: u64,       // 0xA0
    pub s7: u64,       // 0xA8
    pub s8: u64,       // 0xB0
    pub s9: u64,       // 0xB8
    pub s10: u64,      // 0xC0
    pub s11: u64,      // 0xC8
    pub t3: u64,       // 0xD0
    pub t4: u64,       // 0xD8
    pub t5: u64,       // 0xE0
    pub t6: u64,       // 0xE8
    pub user_sp: u64,  // 0xF0
    pub sepc: u64,     // 0xF8
    pub sstatus: u64,  // 0x100
}

/// Frame size rounded to 16-byte stack alignment.
const FRAME_SIZE: usize = 0x110;

core::arch::global_asm!(
    r#"
.align 4
.global trap_entry
.global trap_return

trap_entry:
    csrrw sp, sscratch          // user trap: sp = kstack top, sscratch = user sp
    bnez sp, 1f
    csrrw sp, sscratch          // kernel trap: restore sp, keep running on it
    addi sp, sp, -{frame}
    sd ra, 0x00(sp)
    csrr t0, sepc
    sd t0, 0xF8(sp)
    mv a0, sp
    call {kernel_trap}          // diverges
1:
    addi sp, sp, -{frame}
    sd ra, 0x00(sp)
    sd gp, 0x08(sp)
    sd tp, 0x10(sp)
    sd t0, 0x18(sp)
    sd t1, 0x20(sp)
    sd t2, 0x28(sp)
    sd s0, 0x30(sp)
    sd s1, 0x38(sp)
    sd a0, 0x40(sp)
    sd a1, 0x48(sp)
    sd a2, 0x50(sp)
    sd a3, 0x58(sp)
    sd a4, 0x60(sp)
    sd a5, 0x68(sp)
    sd a6, 0x70(sp)
    sd a7, 0x78(sp)
    sd s2, 0x80(sp)
    sd s3, 0x88(sp)
    sd s4, 0x90(sp)
    sd s5, 0x98(sp)
    sd s6, 0xA0(sp)
    sd s7, 0xA8(sp)
    sd s8, 0xB0(sp)
    sd s9, 0xB8(sp)
    sd s10, 0xC0(sp)
    sd s11, 0xC8(sp)
    sd t3, 0xD0(sp)
    sd t4, 0xD8(sp)
    sd t5, 0xE0(sp)
    sd t6, 0xE8(sp)
    csrr t0, sscratch           // parked user sp
    sd t0, 0xF0(sp)
    csrw sscratch, zero         // we are in the kernel now
    csrr t1, sepc
    sd t1, 0xF8(sp)
    csrr t2, sstatus
    sd t2, 0x100(sp)
    mv a0, sp
    call {handler}
    mv a0, sp

// a0 = frame pointer
trap_return:
    mv sp, a0
    ld t1, 0xF8(sp)
    csrw sepc, t1
    ld t2, 0x100(sp)
    csrw sstatus, t2
    addi t0, sp, {frame}        // kstack top for the next trap
    csrw sscratch, t0
    ld ra, 0x00(sp)
    ld gp, 0x08(sp)
    ld tp, 0x10(sp)
    ld t0, 0x18(sp)
    ld t1, 0x20(sp)
    ld t2, 0x28(sp)
    ld s0, 0x30(sp)
    ld s1, 0x38(sp)
    ld a0, 0x40(sp)
    ld a1, 0x48(sp)
    ld a2, 0x50(sp)
    ld a3, 0x58(sp)
    ld a4, 0x60(sp)
    ld a5, 0x68(sp)
    ld a6, 0x70(sp)
    ld a7, 0x78(sp)
    ld s2, 0x80(sp)
    ld s3, 0x88(sp)
    ld s4, 0x90(sp)
    ld s5, 0x98(sp)
    ld s6, 0xA0(sp)
    ld s7, 0xA8(sp)
    ld s8, 0xB0(sp)
    ld s9, 0xB8(sp)
    ld s10, 0xC0(sp)
    ld s11, 0xC8(sp)
    ld t3, 0xD0(sp)
    ld t4, 0xD8(sp)
    ld t5, 0xE0(sp)
    ld t6, 0xE8(sp)
    ld sp, 0xF0(sp)
    sret
"#,
    frame = const FRAME_SIZE,
    handler = sym user_trap_handler,
    kernel_trap = sym kernel_trap_handler,
);

extern "C" {
    fn trap_entry();
    fn trap_return(frame: u64) -> !;
}

static CURRENT_KSTACK: AtomicU64 = AtomicU64::new(0);

pub fn set_kernel_stack(top: u64) {
    CURRENT_KSTACK.store(top, Ordering::Release);
}

pub fn init() {
    // SAFETY: trap_entry is 4-byte aligned (`.align 4`) and Direct mode
    // dispatches every trap there.
    unsafe {
        stvec::write(trap_entry as usize, stvec::TrapMode::Direct);
        sie::set_stimer();
    }
    arm_timer();
}

fn arm_timer() {
    let now: u64;
    // SAFETY: reading the time CSR.
    unsafe { core::arch::asm!("csrr {}, time", out(reg) now) };
    super::sbi::set_timer(now + TIMER_INTERVAL);
}

/// Service interrupts that became pending while S-mode had them masked
/// (the idle loop). Re-arming the timer through SBI clears the pending
/// bit.
pub fn poll_pending() {
    if riscv::register::sip::read().stimer() {
        crate::timer::on_tick();
        arm_timer();
    }
}

extern "C" fn user_trap_handler(frame: &mut TrapFrame) {
    let cause = scause::read();
    if cause.is_interrupt() {
        if cause.code() == 5 {
            // S-mode timer.
            crate::timer::on_tick();
            arm_timer();
        }
        return;
    }

    match cause.code() {
        // ecall from U-mode
        8 => {
            frame.sepc += 4;
            if let Some(slot) = sched::current_slot() {
                // SAFETY: this core runs `slot`.
                let proc = unsafe { table::slot_mut(slot) };
                proc.regs.ip = frame.sepc;
                proc.regs.sp = frame.user_sp;
                proc.regs.flags = frame.sstatus;
                proc.regs.saved_kernel_sp = frame as *mut TrapFrame as u64;
            }
            frame.a0 = crate::syscall::dispatch(
                frame.a7, frame.a0, frame.a1, frame.a2, frame.a3, frame.a4,
            );
        }
        // Faults from U-mode kill the process.
        _ => {
            log::warn!(
                target: "arch",
                "user fault, scause {} stval {:#x} sepc {:#x}",
                cause.code(),
                stval::read(),
                frame.sepc
            );
            let slot = sched::current_slot().expect("user fault with no current process");
            let wake = crate::process::lifecycle::fault_current(slot);
            sched::retire_and_wake(wake)
        }
    }
}

extern "C" fn kernel_trap_handler(frame: &mut TrapFrame) -> ! {
    panic!(
        "kernel trap: scause {:#x} stval {:#x} sepc {:#x}",
        scause::read().bits(),
        stval::read(),
        frame.sepc
    );
}

/// Resume a blocked syscall at its saved trap frame.
pub fn resume_from_kernel_frame(ksp: u64, ret: u64) -> ! {
    // SAFETY: `ksp` is the frame snapshotted by `user_trap_handler` on
    // this thread's kernel stack, live again now that the thread is
    // current.
    unsafe {
        (*(ksp as *mut TrapFrame)).a0 = ret;
        trap_return(ksp)
    }
}

/// First entry to U-mode: synthesize a minimal frame at the top of the
/// thread's kernel stack and sret through the shared return path.
pub fn enter_user(ip: u64, sp: u64, flags: u64) -> ! {
    let kstack_top = CURRENT_KSTACK.load(Ordering::Acquire);
    let frame_at = kstack_top - FRAME_SIZE as u64;
    // SAFETY: the kernel stack top was just installed by the scheduler
    // for this thread; the frame area is dead stack space.
    unsafe {
        let frame = &mut *(frame_at as *mut TrapFrame);
        core::ptr::write_bytes(frame as *mut TrapFrame as *mut u8, 0, FRAME_SIZE);
        frame.user_sp = sp;
        frame.sepc = ip;
        // SPP clear (U-mode), SPIE/SUM from the caller.
        frame.sstatus = flags & !(1 << 8);
        trap_return(frame_at)
    }
}

/// Pivot to `stack_top` and tail-call `f`.
///
/// # Safety
///
/// `stack_top` must be an exclusively-owned live stack; `f` never
/// returns.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_stack_and_run(stack_top: u64, f: extern "C" fn() -> !) -> ! {
    core::arch::naked_asm!(
        "andi sp, a0, -16",
        "jr a1",
    );
}
