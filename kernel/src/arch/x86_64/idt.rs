//! Interrupt descriptor table, PIC, and handlers.
//!
//! Ring-0 faults are fatal; ring-3 faults kill the offending process
//! (and hand it to the supervisor if it is a registered service). IRQ 0
//! drives the tick, IRQ 1 the keyboard. Vectors 0xF0/0xF1 are the
//! schedule and TLB-shootdown IPIs.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::{process, sched};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;
pub const KEYBOARD_VECTOR: u8 = PIC_1_OFFSET + 1;
pub const SCHEDULE_IPI_VECTOR: u8 = 0xF0;
pub const TLB_IPI_VECTOR: u8 = 0xF1;

pub static PICS: Mutex<ChainedPics> =
    // SAFETY: the standard remap offsets; no other code programs the
    // PICs.
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        // SAFETY: the IST index refers to the dedicated double-fault
        // stack installed in the TSS.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[TIMER_VECTOR].set_handler_fn(timer_handler);
        idt[KEYBOARD_VECTOR].set_handler_fn(keyboard_handler);
        // Spurious PIC interrupts (IRQ 7/15) need a sink even when
        // masked.
        idt[PIC_1_OFFSET + 7].set_handler_fn(spurious_handler);
        idt[PIC_2_OFFSET + 7].set_handler_fn(spurious_handler);
        idt[SCHEDULE_IPI_VECTOR].set_handler_fn(schedule_ipi_handler);
        idt[TLB_IPI_VECTOR].set_handler_fn(tlb_ipi_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
    // SAFETY: PIC initialization sequence; interrupts are still off.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Unmask only timer and keyboard.
        pics.write_masks(!0b11, 0xFF);
    }
}

fn from_user(frame: &InterruptStackFrame) -> bool {
    frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3
}

/// Kill the faulting user process and schedule away. Noreturn.
fn kill_user(kind: &str, frame: &InterruptStackFrame) -> ! {
    let slot = sched::current_slot().expect("ring-3 fault with no current process");
    log::warn!(
        target: "arch",
        "{} in userspace at {:#x}",
        kind,
        frame.instruction_pointer.as_u64()
    );
    let wake = process::lifecycle::fault_current(slot);
    sched::retire_and_wake(wake)
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    if from_user(&frame) {
        kill_user("divide error", &frame);
    }
    panic!("kernel divide error at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    if from_user(&frame) {
        kill_user("invalid opcode", &frame);
    }
    panic!("kernel invalid opcode at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::debug!(target: "arch", "breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, code: u64) {
    if from_user(&frame) {
        kill_user("general protection fault", &frame);
    }
    panic!(
        "kernel GP fault (code {:#x}) at {:#x}",
        code,
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    code: PageFaultErrorCode,
) {
    let addr = x86_64::registers::control::Cr2::read_raw();
    if from_user(&frame) {
        log::warn!(target: "arch", "user page fault at {:#x} ({:?})", addr, code);
        kill_user("page fault", &frame);
    }
    panic!(
        "kernel page fault at {:#x} ({:?}), ip {:#x}",
        addr,
        code,
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _code: u64) -> ! {
    panic!("double fault, ip {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    crate::timer::on_tick();
    // SAFETY: end-of-interrupt for the vector being serviced.
    unsafe { PICS.lock().notify_end_of_interrupt(TIMER_VECTOR) };
}

extern "x86-interrupt" fn keyboard_handler(_frame: InterruptStackFrame) {
    // SAFETY: reading the PS/2 data port is the required acknowledgment.
    let scancode: u8 = unsafe {
        use x86_64::instructions::port::Port;
        Port::new(0x60).read()
    };
    crate::drivers::keyboard::handle_scancode(scancode);
    // SAFETY: end-of-interrupt for the vector being serviced.
    unsafe { PICS.lock().notify_end_of_interrupt(KEYBOARD_VECTOR) };
}

extern "x86-interrupt" fn spurious_handler(_frame: InterruptStackFrame) {}

extern "x86-interrupt" fn schedule_ipi_handler(_frame: InterruptStackFrame) {
    sched::this_cpu()
        .ipi_schedule
        .store(true, core::sync::atomic::Ordering::Release);
    super::ipi::eoi();
}

extern "x86-interrupt" fn tlb_ipi_handler(_frame: InterruptStackFrame) {
    sched::service_tlb_flush();
    super::ipi::eoi();
}
