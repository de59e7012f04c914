//! SYSCALL/SYSRET entry and the kernel-frame resume path.
//!
//! On entry the stub swaps GS, parks the user stack pointer in the
//! per-cpu slot block, pivots onto the kernel stack, and pushes a
//! [`SyscallFrame`]. The Rust side snapshots the user context into the
//! process (so handlers may block), dispatches, and the stub writes the
//! return value into the frame before unwinding it with `sysretq`.
//!
//! A thread that blocked resumes through `syscall_resume_frame`: the
//! scheduler hands it the saved frame pointer and the staged return
//! value, and the shared epilogue unwinds exactly as if the handler had
//! just returned.

use x86_64::{
    registers::{
        model_specific::{Efer, EferFlags, LStar, SFMask, Star},
        rflags::RFlags,
    },
    VirtAddr,
};

use crate::{process::table, sched};

/// Saved user context, in push order from the entry stub. `rax` doubles
/// as syscall number (entry) and return value (exit).
#[repr(C)]
pub struct SyscallFrame {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub r10: u64,
    pub r8: u64,
    pub r9: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    /// User RFLAGS (from r11).
    pub r11: u64,
    /// User RIP (from rcx).
    pub rcx: u64,
    pub user_rsp: u64,
}

core::arch::global_asm!(
    r#"
.global syscall_entry
.global syscall_resume_frame

syscall_entry:
    swapgs
    mov gs:[0x08], rsp          // park user rsp
    mov rsp, gs:[0x00]          // kernel stack top
    push qword ptr gs:[0x08]    // user rsp
    push rcx                    // user rip
    push r11                    // user rflags
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    push r9
    push r8
    push r10
    push rdx
    push rsi
    push rdi
    push rax                    // syscall number
    mov rdi, rsp
    call {entry}
    mov [rsp], rax              // return value into frame.rax

syscall_unwind:
    pop rax
    pop rdi
    pop rsi
    pop rdx
    pop r10
    pop r8
    pop r9
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    pop r11                     // user rflags
    pop rcx                     // user rip
    pop rsp                     // user stack
    swapgs
    sysretq

// rdi = saved kernel frame pointer, rsi = return value
syscall_resume_frame:
    mov rsp, rdi
    mov [rsp], rsi
    jmp syscall_unwind
"#,
    entry = sym syscall_entry_rust,
);

extern "C" {
    pub fn syscall_entry(); // installed in LSTAR; never called from Rust
    fn syscall_resume_frame(ksp: u64, ret: u64) -> !;
}

/// Rust side of the entry stub.
extern "C" fn syscall_entry_rust(frame: &mut SyscallFrame) -> u64 {
    // Snapshot the user context so any handler may block and the
    // scheduler can later resume this exact frame.
    if let Some(slot) = sched::current_slot() {
        // SAFETY: this core runs `slot`.
        let proc = unsafe { table::slot_mut(slot) };
        proc.regs.ip = frame.rcx;
        proc.regs.sp = frame.user_rsp;
        proc.regs.flags = frame.r11;
        proc.regs.saved_kernel_sp = frame as *mut SyscallFrame as u64;
    }
    crate::syscall::dispatch(
        frame.rax, frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8,
    )
}

/// Resume a blocked thread at its saved syscall frame with `ret` as the
/// syscall's return value.
pub fn resume_from_kernel_frame(ksp: u64, ret: u64) -> ! {
    // SAFETY: `ksp` is the frame pointer snapshotted by
    // `syscall_entry_rust` on this thread's kernel stack, which is live
    // again because the scheduler just made this thread current.
    unsafe { syscall_resume_frame(ksp, ret) }
}

/// Program the SYSCALL/SYSRET MSRs.
pub fn init() {
    let sel = super::gdt::selectors();
    // SAFETY: standard SYSCALL setup; selectors match the loaded GDT and
    // the entry symbol is the stub above.
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        Star::write(sel.user_code, sel.user_data, sel.kernel_code, sel.kernel_data)
            .expect("GDT selector layout matches STAR constraints");
        // Mask IF (and DF per ABI) while in the kernel.
        SFMask::write(RFlags::INTERRUPT_FLAG | RFlags::DIRECTION_FLAG);
    }
}
