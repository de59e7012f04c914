//! Kernel binary: per-arch entry points, boot hand-off normalization,
//! and the panic path.
//!
//! The binary is only meaningful on bare metal; host builds (which
//! exist so `cargo test` can compile the workspace) get a stub main.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use core::panic::PanicInfo;

#[cfg(target_os = "none")]
use crux_kernel::{arch, bootstrap, mm::pmm::MemRegion, println};

/// Fatal error path: banner to serial and the in-memory log, then halt.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("\n*** KERNEL PANIC ***");
    println!("{}", info);
    crux_kernel::klog::raw_append("panic: kernel halted\n");
    arch::halt_forever();
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("crux-kernel only runs on bare metal; build for a *-none target");
}

// ---------------------------------------------------------------------------
// x86_64: bootloader_api hand-off
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_boot {
    use bootloader_api::{
        config::Mapping, entry_point, info::MemoryRegionKind, BootInfo, BootloaderConfig,
    };

    use super::*;
    use crux_kernel::mm::KERNEL_VIRT_BASE;

    /// Ask the loader to map all physical memory at the kernel's fixed
    /// direct-map base, so `phys + KERNEL_VIRT_BASE` works from the
    /// first instruction.
    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::FixedAddress(KERNEL_VIRT_BASE));
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        arch::init();

        let mut regions = [MemRegion {
            start: 0,
            len: 0,
            usable: false,
        }; 128];
        let mut count = 0;
        for region in boot_info.memory_regions.iter() {
            if count == regions.len() {
                break;
            }
            regions[count] = MemRegion {
                start: region.start,
                len: region.end - region.start,
                usable: region.kind == MemoryRegionKind::Usable,
            };
            count += 1;
        }

        let framebuffer = boot_info.framebuffer.as_ref().into_option().map(|fb| {
            let info = fb.info();
            bootstrap::Framebuffer {
                base: fb.buffer().as_ptr() as u64,
                width: info.width,
                height: info.height,
                stride: info.stride,
                bytes_per_pixel: info.bytes_per_pixel,
            }
        });

        let initrd = match (boot_info.ramdisk_addr.into_option(), boot_info.ramdisk_len) {
            (Some(addr), len) if len > 0 => {
                // SAFETY: the loader mapped the ramdisk at `addr` for
                // `len` bytes and excluded it from usable memory.
                Some(unsafe { core::slice::from_raw_parts(addr as *const u8, len as usize) })
            }
            _ => None,
        };

        let handoff = bootstrap::BootHandoff {
            memory_map: &regions[..count],
            framebuffer,
            initrd,
        };
        bootstrap::run(&handoff)
    }
}

// ---------------------------------------------------------------------------
// riscv64: boot-shim hand-off
// ---------------------------------------------------------------------------

/// riscv64 boot contract: a prior stage (out-of-scope boot shim) has
/// enabled Sv48 with the direct map in place and jumps here in S-mode on
/// the boot hart. QEMU virt memory layout, single hart.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
pub extern "C" fn kernel_main(_hartid: usize, _dtb: usize) -> ! {
    arch::init();

    const RAM_BASE: u64 = 0x8000_0000;
    const RAM_SIZE: u64 = 128 << 20;
    // The first 4 MiB hold OpenSBI and the kernel image.
    let regions = [
        MemRegion {
            start: RAM_BASE,
            len: 4 << 20,
            usable: false,
        },
        MemRegion {
            start: RAM_BASE + (4 << 20),
            len: RAM_SIZE - (4 << 20),
            usable: true,
        },
    ];

    let handoff = bootstrap::BootHandoff {
        memory_map: &regions,
        framebuffer: None,
        initrd: None,
    };
    bootstrap::run(&handoff)
}
