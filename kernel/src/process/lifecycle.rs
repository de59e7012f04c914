//! Process creation, exit, and reaping.
//!
//! Creation claims a table slot, builds an address space and a contiguous
//! kernel stack, and clones the spawning namespace. The new process is
//! made runnable separately (`sched::start`) once its image is loaded, so
//! a half-built process is never visible to a run queue.
//!
//! Exit tears down in dependency order: children first, then fds, then
//! user memory (with TLB shootdowns), and finally the kernel stack --
//! which is deferred, because a thread cannot free the stack it is
//! running on. The parent's `wait` (or slot reuse) finishes the job.

use super::{table, thread, PendingOp, ProcState, Process, WaitTarget};
use crate::{
    error::{KernelError, KernelResult, SchedError},
    fs,
    mm::{
        layout::KERNEL_STACK_PAGES,
        paging, pmm,
    },
    process::fd,
    sched,
};

/// Who is creating a process, which decides core placement and namespace
/// inheritance.
#[derive(Clone, Copy)]
pub enum Spawner {
    /// Kernel-internal creation (supervisor, bootstrap): BSP, root
    /// namespace.
    Kernel,
    /// A userspace parent: least-loaded core, parent namespace.
    User { parent_slot: usize },
}

/// Policy check for `max_children` before `parent` gains another child.
fn child_quota_check(parent: &Process) -> KernelResult<()> {
    if parent.quotas.allows_child(parent.children) {
        Ok(())
    } else {
        Err(KernelError::QuotaExceeded {
            resource: "children",
        })
    }
}

/// Claim and initialize a fresh process. Returns the slot index; the
/// process is left `Blocked` until `sched::start`.
pub fn create(name: &str, spawner: Spawner) -> KernelResult<usize> {
    if let Spawner::User { parent_slot } = spawner {
        // SAFETY: parent runs on this core (it made the syscall).
        child_quota_check(unsafe { table::slot_mut(parent_slot) })?;
    }
    let slot = table::claim_slot().ok_or(SchedError::NoFreeSlots)?;

    let space_root = match paging::create_address_space() {
        Ok(root) => root,
        Err(e) => {
            // SAFETY: freshly claimed slot, not yet visible to the
            // scheduler; we are its only mutator.
            unsafe { table::slot_mut(slot).state = ProcState::Free };
            return Err(e);
        }
    };
    let kstack = match pmm::alloc_contiguous_pages(KERNEL_STACK_PAGES) {
        Ok(p) => p,
        Err(e) => {
            paging::free_address_space(space_root);
            // SAFETY: as above.
            unsafe { table::slot_mut(slot).state = ProcState::Free };
            return Err(e);
        }
    };

    // SAFETY: slot is ours until `sched::start` publishes it.
    let proc = unsafe { table::slot_mut(slot) };
    proc.set_name(name);
    proc.space_root = space_root;
    proc.kstack_phys = kstack;
    proc.regs.flags = crate::arch::initial_user_flags();
    proc.fresh = true;

    match spawner {
        Spawner::Kernel => {
            proc.parent_pid = table::NO_PID;
            proc.assigned_core = 0;
            fs::clone_root_ns(&mut proc.ns);
        }
        Spawner::User { parent_slot } => {
            proc.parent_pid = table::slot_pid(parent_slot);
            proc.assigned_core = sched::least_loaded_core();
            proc.vt = {
                // SAFETY: parent is running on this core (it made the
                // syscall), so we hold its mutation right.
                let parent = unsafe { table::slot_mut(parent_slot) };
                parent.children += 1;
                proc.uid = parent.uid;
                proc.gid = parent.gid;
                proc.quotas = parent.quotas;
                parent.vt
            };
            thread::with_ns(parent_slot, |ns| ns.clone_into(&mut proc.ns));
        }
    }
    Ok(slot)
}

/// Create a thread sharing the parent's group (creating the group on the
/// first clone). The thread gets its own kernel stack and register state
/// but references the shared address space, fd table and namespace.
pub fn create_thread(parent_slot: usize, entry: u64, user_sp: u64) -> KernelResult<usize> {
    // SAFETY: parent runs on this core.
    let parent = unsafe { table::slot_mut(parent_slot) };
    child_quota_check(parent)?;
    // On the first clone the parent's private resources drain into a new
    // group (refcount 1, the parent's own membership). The thread being
    // built holds a second reference either way.
    let group = match parent.group {
        Some(g) => g,
        None => thread::create_for(parent).ok_or(SchedError::NoFreeSlots)?,
    };
    thread::retain(group);
    let undo_ref = |group: usize| {
        // The parent's own membership keeps the count above zero, so this
        // can never free the shared space.
        let _ = thread::release(group);
    };

    let slot = match table::claim_slot() {
        Some(s) => s,
        None => {
            undo_ref(group);
            return Err(SchedError::NoFreeSlots.into());
        }
    };
    let kstack = match pmm::alloc_contiguous_pages(KERNEL_STACK_PAGES) {
        Ok(p) => p,
        Err(e) => {
            undo_ref(group);
            // SAFETY: freshly claimed slot, not yet published.
            unsafe { table::slot_mut(slot).state = ProcState::Free };
            return Err(e);
        }
    };

    // SAFETY: slot is ours until published; parent as above.
    let proc = unsafe { table::slot_mut(slot) };
    let parent = unsafe { table::slot_mut(parent_slot) };
    proc.set_name(parent.name());
    proc.group = Some(group);
    proc.space_root = 0; // group root is authoritative
    proc.kstack_phys = kstack;
    proc.parent_pid = parent.pid;
    parent.children += 1;
    proc.regs.ip = entry;
    proc.regs.sp = user_sp;
    proc.regs.flags = crate::arch::initial_user_flags();
    proc.fresh = true;
    proc.brk = parent.brk;
    proc.uid = parent.uid;
    proc.gid = parent.gid;
    proc.vt = parent.vt;
    proc.quotas = parent.quotas;
    proc.assigned_core = sched::least_loaded_core();
    Ok(slot)
}

/// Map a fresh user stack: `USER_STACK_PAGES` zeroed pages ending at
/// `USER_STACK_TOP` (the topmost of which doubles as the argv page).
/// Returns the number of pages mapped, for quota accounting.
pub fn map_user_stack(space_root: u64) -> KernelResult<usize> {
    use crate::mm::layout::{USER_STACK_PAGES, USER_STACK_TOP};
    use crate::mm::paging::MapFlags;
    for i in 0..USER_STACK_PAGES {
        let vaddr = USER_STACK_TOP - ((i + 1) * crate::mm::PAGE_SIZE) as u64;
        let frame = pmm::alloc_page()?;
        paging::zero_frame(frame);
        if let Err(e) = paging::map_page(
            space_root,
            vaddr,
            frame,
            MapFlags::USER | MapFlags::WRITABLE | MapFlags::NO_EXECUTE,
        ) {
            pmm::free_page(frame);
            return Err(e);
        }
    }
    Ok(USER_STACK_PAGES)
}

/// Free the user-visible memory of a slot: either its private address
/// space (with shootdowns) or its group reference.
fn release_memory(slot: usize) {
    // SAFETY: caller holds the slot's mutation right (exit path or kill
    // of a non-running process).
    let proc = unsafe { table::slot_mut(slot) };
    match proc.group.take() {
        Some(g) => {
            if let Some((root, cores)) = thread::release(g) {
                sched::tlb_shootdown(cores);
                paging::switch_to_kernel();
                paging::free_address_space(root);
            }
        }
        None => {
            if proc.space_root != 0 {
                sched::tlb_shootdown(proc.cores_ran_on);
                paging::switch_to_kernel();
                paging::free_address_space(proc.space_root);
                proc.space_root = 0;
            }
        }
    }
    proc.mem_pages = 0;
}

/// Close every fd the slot owns. Inline fds always; the shared group
/// table dies with the group's last reference instead.
fn close_all_fds(slot: usize) {
    // SAFETY: caller holds the slot's mutation right.
    let proc = unsafe { table::slot_mut(slot) };
    let inline_fds: [Option<fd::FdKind>; fd::MAX_FDS] =
        core::array::from_fn(|i| proc.fds.take(i));
    for kind in inline_fds.into_iter().flatten() {
        fd::release_kind(&kind);
    }
}

/// Recursively kill the children of `victim_slot` (skipping same-group
/// sibling threads, which die through the group refcount).
fn kill_children(victim_slot: usize) {
    let victim_pid = table::slot_pid(victim_slot);
    // SAFETY: read-only peek; group field is stable during exit.
    let victim_group = unsafe { table::slot_mut(victim_slot).group };
    for idx in 0..table::MAX_PROCESSES {
        if idx == victim_slot || table::slot_state(idx) == ProcState::Free {
            continue;
        }
        // SAFETY: child is not running on this core (we are); kills of
        // concurrently-running children rely on the Dead state being
        // checked by every scheduler pop.
        let child = unsafe { table::slot_mut(idx) };
        if child.parent_pid != victim_pid {
            continue;
        }
        if victim_group.is_some() && child.group == victim_group {
            continue;
        }
        kill_children(idx);
        if child.state == ProcState::Running {
            // Racing a child that is on-CPU elsewhere: its address space
            // and stack must stay live until it next enters the kernel.
            // Mark it Dead and let the frames drift; a dying process may
            // leak.
            child.state = ProcState::Dead;
            continue;
        }
        close_all_fds(idx);
        release_memory(idx);
        child.ns.clear();
        child.state = ProcState::Dead;
        child.needs_stack_free = true;
    }
}

/// Terminate the current process. Returns the parent slot to wake (via
/// `sched::retire_and_wake`, so the wake happens only after this core
/// has left the dying thread's kernel stack).
pub fn exit_current(slot: usize, status: u64) -> Option<usize> {
    kill_children(slot);
    close_all_fds(slot);
    release_memory(slot);

    // SAFETY: we are the core running `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    proc.ns.clear();
    proc.exit_status = status;
    proc.needs_stack_free = true;
    proc.pending = PendingOp::None;

    let pid = proc.pid;
    let parent_pid = proc.parent_pid;
    let parent_slot = table::slot_of_pid(parent_pid);
    let wake = match parent_slot {
        Some(pslot) if table::slot_state(pslot) != ProcState::Free => {
            proc.state = ProcState::Zombie;
            let wanted = {
                // SAFETY: parent is blocked or running elsewhere; we only
                // inspect wait state, which the waker protocol permits.
                // The borrow ends before the wake is delivered.
                let parent = unsafe { table::slot_mut(pslot) };
                parent.state == ProcState::Blocked
                    && match parent.waiting_for {
                        Some(WaitTarget::AnyChild) => true,
                        Some(WaitTarget::Pid(p)) => p == pid,
                        None => false,
                    }
            };
            wanted.then_some(pslot)
        }
        _ => {
            // Orphaned: no one will wait; the slot recycler frees the
            // stack.
            proc.state = ProcState::Dead;
            None
        }
    };
    log::debug!(target: "proc", "pid {} exited with status {}", pid, status);
    wake
}

/// Reap one zombie child of `parent_slot` matching `target`. Returns
/// `(child_pid, status)` if one was reaped.
pub fn reap_zombie(parent_slot: usize, target: WaitTarget) -> Option<(u64, u64)> {
    let parent_pid = table::slot_pid(parent_slot);
    for idx in 0..table::MAX_PROCESSES {
        if table::slot_state(idx) != ProcState::Zombie {
            continue;
        }
        // SAFETY: zombies have no other mutator; the parent reaps them.
        let child = unsafe { table::slot_mut(idx) };
        if child.parent_pid != parent_pid {
            continue;
        }
        if let WaitTarget::Pid(p) = target {
            if child.pid != p {
                continue;
            }
        }
        let result = (child.pid, child.exit_status);
        if child.needs_stack_free && child.kstack_phys != 0 {
            pmm::free_contiguous_pages(child.kstack_phys, KERNEL_STACK_PAGES);
            child.kstack_phys = 0;
            child.needs_stack_free = false;
        }
        child.state = ProcState::Free;
        // SAFETY: parent runs on this core.
        unsafe {
            let parent = table::slot_mut(parent_slot);
            parent.children = parent.children.saturating_sub(1);
        }
        return Some(result);
    }
    None
}

/// Does `parent_slot` have any child matching `target` in any live state?
pub fn has_child(parent_slot: usize, target: WaitTarget) -> bool {
    let parent_pid = table::slot_pid(parent_slot);
    (0..table::MAX_PROCESSES).any(|idx| {
        if table::slot_state(idx) == ProcState::Free {
            return false;
        }
        // SAFETY: read-only scan, stale values tolerated.
        let child = unsafe { table::slot_mut(idx) };
        child.parent_pid == parent_pid
            && match target {
                WaitTarget::AnyChild => true,
                WaitTarget::Pid(p) => child.pid == p,
            }
    })
}

/// Kill the current process after a ring-3 fault. The supervisor gets a
/// chance to restart it if it is a registered service. Returns the
/// parent slot to wake, as `exit_current` does.
pub fn fault_current(slot: usize) -> Option<usize> {
    let pid = table::slot_pid(slot);
    log::warn!(target: "proc", "pid {} killed by fault", pid);
    let wake = exit_current(slot, u64::MAX);
    crate::services::supervisor::notify_fault(pid);
    wake
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::ResourceQuotas;

    // The quota shape a container applies: small fixed limits on an
    // otherwise ordinary process.

    #[test]
    fn child_quota_denies_spawn_past_limit() {
        let mut parent = Process::empty();
        parent.quotas = ResourceQuotas {
            max_children: 2,
            ..ResourceQuotas::unlimited()
        };
        parent.children = 1;
        assert!(child_quota_check(&parent).is_ok());
        parent.children = 2;
        assert!(matches!(
            child_quota_check(&parent),
            Err(KernelError::QuotaExceeded {
                resource: "children"
            })
        ));
    }

    #[test]
    fn unlimited_quota_never_denies_children() {
        let mut parent = Process::empty();
        parent.children = usize::MAX - 1;
        assert!(child_quota_check(&parent).is_ok());
    }
}
