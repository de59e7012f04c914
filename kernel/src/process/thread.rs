//! Thread groups.
//!
//! Threads that share an address space do so through a thread group: a
//! refcounted bundle of the shared page-table root, fd table, namespace,
//! and a group-wide `cores_ran_on` bitmap for TLB shootdowns. A process
//! with a group uses the group's resources in preference to its inline
//! ones (always through the accessors in this module, so the two never
//! drift).

use crate::{
    fs::namespace::Namespace,
    process::{fd::FdTable, table, Process},
    sync::{TicketLock, TicketMutex},
};

/// Maximum simultaneous thread groups.
pub const MAX_GROUPS: usize = 32;

/// One shared resource bundle.
pub struct ThreadGroup {
    pub active: bool,
    /// Threads referencing this group. At zero the shared address space
    /// is freed.
    pub refs: u32,
    pub space_root: u64,
    pub fds: FdTable,
    pub ns: Namespace,
    pub cores_ran_on: u64,
}

impl ThreadGroup {
    const fn new() -> Self {
        Self {
            active: false,
            refs: 0,
            space_root: 0,
            fds: FdTable::new(),
            ns: Namespace::new(),
            cores_ran_on: 0,
        }
    }
}

static GROUPS: [TicketMutex<ThreadGroup>; MAX_GROUPS] =
    [const { TicketMutex::new(ThreadGroup::new()) }; MAX_GROUPS];

static ALLOC_LOCK: TicketLock = TicketLock::new();

/// Create a group seeded from `proc`'s private resources. The process's
/// inline fd table and namespace are drained into the group; its space
/// root is taken over.
///
/// Called on first `create_thread` for an ungrouped process.
pub fn create_for(proc: &mut Process) -> Option<usize> {
    ALLOC_LOCK.lock();
    let mut found = None;
    for (idx, slot) in GROUPS.iter().enumerate() {
        let mut g = slot.lock();
        if !g.active {
            g.active = true;
            g.refs = 1;
            g.space_root = proc.space_root;
            g.cores_ran_on = proc.cores_ran_on;
            g.fds = core::mem::take(&mut proc.fds);
            proc.ns.clone_into(&mut g.ns);
            proc.ns.clear();
            found = Some(idx);
            break;
        }
    }
    ALLOC_LOCK.unlock();
    if let Some(idx) = found {
        proc.group = Some(idx);
    }
    found
}

/// Add one thread reference.
pub fn retain(group: usize) {
    if group < MAX_GROUPS {
        let mut g = GROUPS[group].lock();
        if g.active {
            g.refs += 1;
        }
    }
}

/// Drop one thread reference. Returns the shared space root to free when
/// this was the last reference (the caller owns the shootdown + free).
pub fn release(group: usize) -> Option<(u64, u64)> {
    if group >= MAX_GROUPS {
        return None;
    }
    let mut g = GROUPS[group].lock();
    if !g.active {
        return None;
    }
    g.refs = g.refs.saturating_sub(1);
    if g.refs > 0 {
        return None;
    }
    let root = g.space_root;
    let cores = g.cores_ran_on;
    g.active = false;
    g.space_root = 0;
    g.ns.clear();
    g.fds = FdTable::new();
    g.cores_ran_on = 0;
    Some((root, cores))
}

/// Shared root of `group`, if active.
pub fn group_root(group: usize) -> Option<u64> {
    if group >= MAX_GROUPS {
        return None;
    }
    let g = GROUPS[group].lock();
    if g.active {
        Some(g.space_root)
    } else {
        None
    }
}

/// Record that `core` ran a thread of `group`.
pub fn note_core(group: usize, core: usize) {
    if group < MAX_GROUPS {
        let mut g = GROUPS[group].lock();
        if g.active {
            g.cores_ran_on |= 1 << core;
        }
    }
}

/// Run `f` against the fd table that governs `slot` (group's if grouped,
/// else the process's own).
pub fn with_fds<R>(slot: usize, f: impl FnOnce(&mut FdTable) -> R) -> R {
    // SAFETY: the caller runs on the core owning `slot` (syscall path) or
    // during creation; either way it holds the slot's mutation right.
    let proc = unsafe { table::slot_mut(slot) };
    match proc.group {
        Some(gidx) => {
            let mut g = GROUPS[gidx].lock();
            if g.active {
                f(&mut g.fds)
            } else {
                f(&mut proc.fds)
            }
        }
        None => f(&mut proc.fds),
    }
}

/// Run `f` against the namespace that governs `slot`.
pub fn with_ns<R>(slot: usize, f: impl FnOnce(&mut Namespace) -> R) -> R {
    // SAFETY: as in `with_fds`.
    let proc = unsafe { table::slot_mut(slot) };
    match proc.group {
        Some(gidx) => {
            let mut g = GROUPS[gidx].lock();
            if g.active {
                f(&mut g.ns)
            } else {
                f(&mut proc.ns)
            }
        }
        None => f(&mut proc.ns),
    }
}
