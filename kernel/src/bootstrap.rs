//! Arch-neutral boot: normalize the loader hand-off, bring subsystems up
//! in dependency order, launch the initrd payload, enter the scheduler.
//!
//! Init order is load-bearing: klog first (so everything can log), then
//! PMM → kernel space → heap, then the service launches, and finally the
//! scheduler -- which never returns.

use crate::{
    fs::initrd,
    mm::{self, pmm::MemRegion},
    process::{lifecycle, table},
    sched,
    services::supervisor,
};

/// Framebuffer description from the loader. The kernel does not draw;
/// this is recorded for the (userspace) console renderer to claim.
#[derive(Debug, Clone, Copy)]
pub struct Framebuffer {
    pub base: u64,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub bytes_per_pixel: usize,
}

/// Everything the outside loader hands us.
pub struct BootHandoff<'a> {
    pub memory_map: &'a [MemRegion],
    pub framebuffer: Option<Framebuffer>,
    /// Contiguous initrd image, already mapped and excluded from the
    /// usable memory regions.
    pub initrd: Option<&'static [u8]>,
}

#[cfg(target_arch = "x86_64")]
const ARCH_NAME: &str = "x86_64";
#[cfg(target_arch = "riscv64")]
const ARCH_NAME: &str = "riscv64";
#[cfg(not(any(target_arch = "x86_64", target_arch = "riscv64")))]
const ARCH_NAME: &str = "host";

/// Bring the kernel up and never return.
pub fn run(handoff: &BootHandoff<'_>) -> ! {
    crate::klog::init();
    log::info!(
        target: "kernel",
        "crux {} booting on {}",
        env!("CARGO_PKG_VERSION"),
        ARCH_NAME
    );
    if let Some(fb) = handoff.framebuffer {
        log::info!(
            target: "kernel",
            "framebuffer {}x{} stride {} at {:#x}",
            fb.width,
            fb.height,
            fb.stride,
            fb.base
        );
    }

    if let Err(e) = mm::pmm::init(handoff.memory_map) {
        panic!("PMM init failed: {}", e);
    }
    let kroot = match mm::paging::init_kernel_space() {
        Ok(root) => root,
        Err(e) => panic!("kernel address space init failed: {}", e),
    };
    mm::paging::switch_address_space(kroot);
    if let Err(e) = mm::heap::init() {
        panic!("heap init failed: {}", e);
    }

    match handoff.initrd {
        Some(image) => {
            initrd::mount_all(image);
            launch_boot_services(image);
        }
        None => log::warn!(target: "kernel", "no initrd; nothing to run"),
    }

    log::info!(target: "kernel", "entering scheduler");
    sched::schedule_next()
}

/// Start what the initrd brought: entries named `svc.<name>` become
/// supervised file servers mounted at `/srv/<name>`; the entry named
/// `init` becomes the first ordinary process.
fn launch_boot_services(image: &'static [u8]) {
    for entry in initrd::entries(image) {
        if let Some(svc) = entry.name.strip_prefix("svc.") {
            let mut path = [0u8; 72];
            let prefix = b"/srv/";
            path[..prefix.len()].copy_from_slice(prefix);
            path[prefix.len()..prefix.len() + svc.len()].copy_from_slice(svc.as_bytes());
            // SAFETY: concatenation of two str slices.
            let mount =
                unsafe { core::str::from_utf8_unchecked(&path[..prefix.len() + svc.len()]) };
            if let Err(e) = supervisor::spawn_service(svc, entry.data, mount) {
                log::error!(target: "kernel", "service {} failed to start: {}", svc, e);
            }
        }
    }

    let Some(init) = initrd::entries(image).find(|e| e.name == "init") else {
        log::warn!(target: "kernel", "initrd has no init entry");
        return;
    };
    match spawn_plain(init.name, init.data) {
        Ok(pid) => log::info!(target: "kernel", "init is pid {}", pid),
        Err(e) => log::error!(target: "kernel", "init failed to start: {}", e),
    }
}

/// Start an unsupervised kernel-spawned process from an ELF image.
fn spawn_plain(name: &str, elf: &[u8]) -> crate::error::KernelResult<u64> {
    let slot = lifecycle::create(name, lifecycle::Spawner::Kernel)?;
    // SAFETY: creation path owns the slot until `sched::start`.
    let space_root = unsafe { table::slot_mut(slot) }.space_root;
    let image = crate::elf::load(space_root, elf)?;
    let stack_pages = lifecycle::map_user_stack(space_root)?;

    // SAFETY: as above.
    let proc = unsafe { table::slot_mut(slot) };
    proc.regs.ip = image.entry;
    proc.regs.sp = crate::arch::initial_user_sp();
    proc.brk = image.brk;
    proc.mem_pages = image.pages_mapped + stack_pages;
    let pid = proc.pid;
    sched::start(slot);
    Ok(pid)
}
