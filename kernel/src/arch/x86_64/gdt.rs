// Global Descriptor Table, TSS, and the selector layout the syscall
// MSRs depend on.

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, DS, ES, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // Double fault stack (16-byte aligned; faults can nest on a bad
        // kernel stack, so this one is dedicated).
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            #[repr(align(16))]
            #[allow(dead_code)] // Alignment wrapper -- accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const STACK;
            let stack_start = VirtAddr::from_ptr(stack_ptr);
            stack_start + STACK_SIZE as u64
        };
        tss
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment()); // 0x08
        let kernel_data = gdt.append(Descriptor::kernel_data_segment()); // 0x10
        let tss = gdt.append(Descriptor::tss_segment(&TSS));             // 0x18 (2 entries)
        let user_data = gdt.append(Descriptor::user_data_segment());     // 0x28 (+RPL3 = 0x2B)
        let user_code = gdt.append(Descriptor::user_code_segment());     // 0x30 (+RPL3 = 0x33)
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_data,
                user_code,
                tss,
            },
        )
    };
}

pub fn selectors() -> &'static Selectors {
    &GDT.1
}

pub fn init() {
    GDT.0.load();
    // SAFETY: the selectors come from the GDT just loaded.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        SS::set_reg(GDT.1.kernel_data);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Point the TSS privilege-0 stack at `top`; this is where the CPU lands
/// on ring-3 interrupts and exceptions.
pub fn set_kernel_interrupt_stack(top: u64) {
    // SAFETY: the TSS is only mutated by the core that owns the current
    // thread, between returns to userspace; the CPU reads it only on a
    // ring transition.
    unsafe {
        let tss = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = VirtAddr::new(top);
    }
}
