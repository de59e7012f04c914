//! The global process table.
//!
//! Fixed array of process slots with interior mutability. The table lock
//! covers only the free-slot scan; per-slot access follows the kernel's
//! single-mutator protocol:
//!
//! - a process is mutated by the core currently running it, or
//! - by a waker that found it `Blocked` through a channel/pipe/console
//!   lock naming it, or
//! - during creation/teardown while it is not yet (no longer) visible to
//!   the scheduler.
//!
//! Wakers always re-validate pid → slot before touching anything; stale
//! pids in wait lists are expected and harmless.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU64, Ordering},
};

use super::{ProcState, Process};
use crate::sync::TicketLock;

/// Process table capacity.
pub const MAX_PROCESSES: usize = 128;

/// Reserved "no process" pid.
pub const NO_PID: u64 = 0;

struct ProcessTable {
    slots: [UnsafeCell<Process>; MAX_PROCESSES],
}

// SAFETY: access to slots is serialized by the protocol documented at the
// top of this module; the table itself only hands out references through
// `slot_mut`, whose contract restates that protocol.
unsafe impl Sync for ProcessTable {}

static TABLE: ProcessTable = ProcessTable {
    slots: [const { UnsafeCell::new(Process::empty()) }; MAX_PROCESSES],
};

/// Guards the free-slot scan in `claim_slot`.
static TABLE_LOCK: TicketLock = TicketLock::new();

/// Monotonic pid source. Pid 0 is reserved.
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Borrow a process slot.
///
/// # Safety
///
/// The caller must hold the mutation right defined by the module-level
/// protocol for this slot, and must not let the reference live across a
/// scheduling boundary (re-look-up by index instead).
pub unsafe fn slot_mut(idx: usize) -> &'static mut Process {
    debug_assert!(idx < MAX_PROCESSES);
    // SAFETY: forwarded to the caller per the function contract.
    unsafe { &mut *TABLE.slots[idx].get() }
}

/// Read-only view of a slot for scans (state, pid). Fields read here are
/// only imprecise in benign ways (a scan may see a state mid-transition).
pub fn slot_state(idx: usize) -> ProcState {
    // SAFETY: reading a `ProcState` is a small plain load; scans tolerate
    // stale values per the module protocol.
    unsafe { (*TABLE.slots[idx].get()).state }
}

pub fn slot_pid(idx: usize) -> u64 {
    // SAFETY: as in `slot_state`.
    unsafe { (*TABLE.slots[idx].get()).pid }
}

/// Claim a free slot, assigning a fresh pid. The slot comes back in
/// `Blocked` state so the scheduler ignores it until creation finishes.
pub fn claim_slot() -> Option<usize> {
    TABLE_LOCK.lock();
    let mut found = None;
    for idx in 0..MAX_PROCESSES {
        // SAFETY: the table lock serializes claim scans; Free/Dead slots
        // have no other mutator.
        let proc = unsafe { slot_mut(idx) };
        // A Dead slot may still be on-CPU elsewhere (killed while
        // running); leave it alone until its core moves on.
        if proc.state == ProcState::Dead
            && crate::sched::cpu(proc.assigned_core).current_slot() == Some(idx)
        {
            continue;
        }
        if matches!(proc.state, ProcState::Free | ProcState::Dead) {
            let stale_stack = if proc.needs_stack_free && proc.kstack_phys != 0 {
                Some(proc.kstack_phys)
            } else {
                None
            };
            *proc = Process::empty();
            proc.pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
            proc.state = ProcState::Blocked;
            found = Some((idx, stale_stack));
            break;
        }
    }
    TABLE_LOCK.unlock();
    let (idx, stale_stack) = found?;
    // A dead process that was never reaped leaves its kernel stack behind;
    // recycle it now that the slot is reused.
    if let Some(phys) = stale_stack {
        crate::mm::pmm::free_contiguous_pages(phys, crate::mm::layout::KERNEL_STACK_PAGES);
    }
    Some(idx)
}

/// Find the slot holding `pid`, if it is still live in any state.
pub fn slot_of_pid(pid: u64) -> Option<usize> {
    if pid == NO_PID {
        return None;
    }
    (0..MAX_PROCESSES).find(|&idx| slot_pid(idx) == pid && slot_state(idx) != ProcState::Free)
}

/// Iterate indices of slots in a given state.
pub fn slots_in_state(state: ProcState) -> impl Iterator<Item = usize> {
    (0..MAX_PROCESSES).filter(move |&idx| slot_state(idx) == state)
}

/// Number of live (not Free/Dead) slots.
pub fn live_count() -> usize {
    (0..MAX_PROCESSES)
        .filter(|&idx| !matches!(slot_state(idx), ProcState::Free | ProcState::Dead))
        .count()
}
