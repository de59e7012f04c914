//! Minimal local-APIC access for inter-processor interrupts.
//!
//! The kernel keeps the 8259 PICs for device IRQs; the LAPIC is touched
//! only to send fixed-vector IPIs and acknowledge them. Register access
//! goes through the direct map at the standard MMIO base.

use crate::mm::layout::phys_to_virt;

const LAPIC_PHYS: u64 = 0xFEE0_0000;
const REG_EOI: u64 = 0xB0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;

#[inline]
fn reg(offset: u64) -> *mut u32 {
    phys_to_virt(LAPIC_PHYS + offset) as *mut u32
}

/// Send `vector` to the core whose APIC id equals its core index.
pub fn send(core: usize, vector: u8) {
    // SAFETY: LAPIC MMIO registers at their architectural offsets; the
    // ICR write is the documented fixed-delivery sequence, and the
    // busy-wait keeps writes serialized per core.
    unsafe {
        reg(REG_ICR_HIGH).write_volatile((core as u32) << 24);
        reg(REG_ICR_LOW).write_volatile(vector as u32);
        while reg(REG_ICR_LOW).read_volatile() & (1 << 12) != 0 {
            core::hint::spin_loop();
        }
    }
}

/// Acknowledge the in-service interrupt.
pub fn eoi() {
    // SAFETY: EOI register write, the architectural acknowledgment.
    unsafe { reg(REG_EOI).write_volatile(0) };
}
