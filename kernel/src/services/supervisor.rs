//! The fault supervisor.
//!
//! Registered services are userspace file servers the kernel keeps
//! alive: each holds its (immutable, borrowed) ELF image, a mount path,
//! and a bounded restart budget. When a service faults in ring 3 the
//! architecture layer kills it and lands here; under the cap the stored
//! image is respawned and re-mounted at the same path, over the cap the
//! service is left absent and the failure is logged.

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    fs::{self, MountFlags},
    ipc::channel,
    process::{self, lifecycle, table},
    sched,
};

/// Registry capacity.
pub const MAX_SERVICES: usize = 16;

/// Default restart budget.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// The server end of a service's channel lands on this fd in the child.
pub const SERVICE_CHANNEL_FD: usize = 3;

struct Service {
    active: bool,
    name: [u8; 32],
    name_len: u8,
    elf: &'static [u8],
    mount_path: [u8; 64],
    mount_len: u8,
    pid: Option<u64>,
    channel: Option<u32>,
    restart_count: u32,
    max_restarts: u32,
    failed: bool,
}

impl Service {
    const fn empty() -> Self {
        Self {
            active: false,
            name: [0; 32],
            name_len: 0,
            elf: &[],
            mount_path: [0; 64],
            mount_len: 0,
            pid: None,
            channel: None,
            restart_count: 0,
            max_restarts: DEFAULT_MAX_RESTARTS,
            failed: false,
        }
    }

    fn name(&self) -> &str {
        // SAFETY: written from a &str in `register`, clamped on a char
        // boundary there.
        unsafe { core::str::from_utf8_unchecked(&self.name[..self.name_len as usize]) }
    }

    fn mount_path(&self) -> &str {
        // SAFETY: as above.
        unsafe { core::str::from_utf8_unchecked(&self.mount_path[..self.mount_len as usize]) }
    }
}

static REGISTRY: Mutex<[Service; MAX_SERVICES]> =
    Mutex::new([const { Service::empty() }; MAX_SERVICES]);

fn copy_clamped(dst: &mut [u8], src: &str) -> u8 {
    let mut n = src.len().min(dst.len());
    while n > 0 && !src.is_char_boundary(n) {
        n -= 1;
    }
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    n as u8
}

/// Launch one service instance from its stored image: a fresh process
/// with the server channel end on fd 3 and the client end mounted at the
/// service's path in the root namespace.
fn launch(name: &str, elf: &'static [u8], mount_path: &str) -> KernelResult<(u64, u32)> {
    let slot = lifecycle::create(name, lifecycle::Spawner::Kernel)?;
    // SAFETY: creation path owns the slot until `sched::start`.
    let space_root = unsafe { table::slot_mut(slot) }.space_root;

    let image = crate::elf::load(space_root, elf)?;
    let stack_pages = lifecycle::map_user_stack(space_root)?;

    let chan = channel::create()?;

    // SAFETY: as above.
    let proc = unsafe { table::slot_mut(slot) };
    proc.regs.ip = image.entry;
    proc.regs.sp = crate::arch::initial_user_sp();
    proc.brk = image.brk;
    proc.mem_pages = image.pages_mapped + stack_pages;
    proc.fds.install(
        SERVICE_CHANNEL_FD,
        process::FdKind::Ipc {
            channel: chan as u32,
            server_side: true,
            server_handle: 0,
            read_offset: 0,
        },
    );

    // The fd above owns the allocation reference; the mount takes its
    // own.
    fs::mount_root(mount_path, chan as u32, MountFlags::REPLACE)?;

    let pid = proc.pid;
    sched::start(slot);
    Ok((pid, chan as u32))
}

/// Register and start a supervised service with the default restart
/// budget.
pub fn spawn_service(name: &str, elf: &'static [u8], mount_path: &str) -> KernelResult<u64> {
    spawn_service_with_limit(name, elf, mount_path, DEFAULT_MAX_RESTARTS)
}

/// Register and start a supervised service with an explicit restart cap.
pub fn spawn_service_with_limit(
    name: &str,
    elf: &'static [u8],
    mount_path: &str,
    max_restarts: u32,
) -> KernelResult<u64> {
    let mut registry = REGISTRY.lock();
    let entry = registry
        .iter_mut()
        .find(|s| !s.active)
        .ok_or(KernelError::QuotaExceeded {
            resource: "supervised services",
        })?;

    entry.active = true;
    entry.name_len = copy_clamped(&mut entry.name, name);
    entry.mount_len = copy_clamped(&mut entry.mount_path, mount_path);
    entry.elf = elf;
    entry.restart_count = 0;
    entry.max_restarts = max_restarts;
    entry.failed = false;
    entry.pid = None;
    entry.channel = None;
    drop(registry);

    let (pid, chan) = launch(name, elf, mount_path)?;

    let mut registry = REGISTRY.lock();
    if let Some(entry) = registry.iter_mut().find(|s| s.active && s.name() == name) {
        entry.pid = Some(pid);
        entry.channel = Some(chan);
    }
    log::info!(target: "svc", "service {} up as pid {} at {}", name, pid, mount_path);
    Ok(pid)
}

/// Called when a ring-3 fault killed `pid`. Restarts the owning service
/// while its budget lasts.
pub fn notify_fault(pid: u64) {
    let mut registry = REGISTRY.lock();
    let Some(idx) = registry
        .iter()
        .position(|s| s.active && s.pid == Some(pid))
    else {
        return;
    };

    let entry = &mut registry[idx];
    entry.pid = None;
    if entry.restart_count >= entry.max_restarts {
        entry.failed = true;
        log::error!(
            target: "svc",
            "service {} exceeded {} restarts; giving up",
            entry.name(),
            entry.max_restarts
        );
        return;
    }
    entry.restart_count += 1;
    let restarts = entry.restart_count;
    let elf = entry.elf;

    let mut name_buf = [0u8; 32];
    let name_len = entry.name_len as usize;
    name_buf[..name_len].copy_from_slice(&entry.name[..name_len]);
    let mut path_buf = [0u8; 64];
    let path_len = entry.mount_len as usize;
    path_buf[..path_len].copy_from_slice(&entry.mount_path[..path_len]);
    drop(registry);

    // SAFETY: byte-for-byte copies of strings validated at registration.
    let name = unsafe { core::str::from_utf8_unchecked(&name_buf[..name_len]) };
    let path = unsafe { core::str::from_utf8_unchecked(&path_buf[..path_len]) };

    log::warn!(target: "svc", "restarting {} (attempt {})", name, restarts);
    match launch(name, elf, path) {
        Ok((new_pid, chan)) => {
            let mut registry = REGISTRY.lock();
            if let Some(entry) = registry.iter_mut().find(|s| s.active && s.name() == name) {
                entry.pid = Some(new_pid);
                entry.channel = Some(chan);
            }
        }
        Err(e) => {
            log::error!(target: "svc", "restart of {} failed: {}", name, e);
            let mut registry = REGISTRY.lock();
            if let Some(entry) = registry.iter_mut().find(|s| s.active && s.name() == name) {
                entry.failed = true;
            }
        }
    }
}

/// Restart count of a service, for diagnostics.
pub fn restart_count(name: &str) -> Option<u32> {
    REGISTRY
        .lock()
        .iter()
        .find(|s| s.active && s.name() == name)
        .map(|s| s.restart_count)
}

/// Has the service permanently failed?
pub fn has_failed(name: &str) -> Option<bool> {
    REGISTRY
        .lock()
        .iter()
        .find(|s| s.active && s.name() == name)
        .map(|s| s.failed)
}
