//! Containers: namespace + quota bundles over the process primitives.
//!
//! A container start is an ordinary process start with three twists: the
//! namespace begins empty (nothing inherited), resource quotas apply,
//! and an optional console channel is mounted at `/dev/console`.

use crate::{
    error::KernelResult,
    fs::MountFlags,
    process::{lifecycle, table, ResourceQuotas},
    sched,
};

/// A named container configuration.
pub struct Container<'a> {
    pub name: &'a str,
    /// Path the container's rootfs server is expected to serve; recorded
    /// for diagnostics, not enforced by the kernel.
    pub rootfs: &'a str,
    pub quotas: ResourceQuotas,
}

/// Start `init_elf` inside the container. Returns the init pid.
pub fn start(
    container: &Container<'_>,
    init_elf: &[u8],
    console_channel: Option<u32>,
) -> KernelResult<u64> {
    let slot = lifecycle::create(container.name, lifecycle::Spawner::Kernel)?;

    // SAFETY: creation path owns the slot until `sched::start`.
    let proc = unsafe { table::slot_mut(slot) };
    // Container processes see only what is explicitly mounted for them.
    proc.ns.clear();
    proc.quotas = container.quotas;
    let space_root = proc.space_root;

    let image = crate::elf::load(space_root, init_elf)?;
    let stack_pages = lifecycle::map_user_stack(space_root)?;

    // SAFETY: as above; re-borrow after the loads.
    let proc = unsafe { table::slot_mut(slot) };
    proc.regs.ip = image.entry;
    proc.regs.sp = crate::arch::initial_user_sp();
    proc.brk = image.brk;
    proc.mem_pages = image.pages_mapped + stack_pages;

    if let Some(chan) = console_channel {
        proc.ns.mount("/dev/console", chan, MountFlags::REPLACE)?;
    }

    let pid = proc.pid;
    log::info!(
        target: "svc",
        "container {} (rootfs {}) starting init as pid {}",
        container.name,
        container.rootfs,
        pid
    );
    sched::start(slot);
    Ok(pid)
}
