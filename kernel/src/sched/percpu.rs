//! Per-core state.
//!
//! Each core owns a `CpuLocal`: its run queue, the currently-running
//! process, pending-IPI flags, and a small assembly-visible slot block
//! reached through GS on x86_64 (the thread pointer on riscv64). The slot
//! block layout is part of the syscall-entry ABI and must not be
//! reordered.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use super::queue::RunQueue;
use crate::sync::TicketMutex;

/// Maximum supported cores.
pub const MAX_CORES: usize = 8;

/// Bytes per scheduler stack. The scheduler pivots here before idling so
/// a blocked thread's kernel stack is never reused under it.
const SCHED_STACK_SIZE: usize = 16 * 1024;

/// Assembly-visible per-core slots. Field offsets are hard-coded in the
/// syscall entry paths (`gs:[0x00]` .. `gs:[0x20]`).
#[repr(C)]
pub struct AsmSlots {
    /// 0x00: kernel stack top for syscall entry.
    pub kernel_stack_top: u64,
    /// 0x08: user stack pointer parked during syscall entry.
    pub saved_user_sp: u64,
    /// 0x10: user instruction pointer (trap paths).
    pub saved_user_ip: u64,
    /// 0x18: user flags (trap paths).
    pub saved_user_flags: u64,
    /// 0x20: kernel stack pointer of the active syscall frame.
    pub saved_kernel_sp: u64,
    /// 0x28: this core's id, for `arch::cpu_id`.
    pub cpu_id: u64,
}

/// One core's kernel-side state.
pub struct CpuLocal {
    pub id: usize,
    pub asm: UnsafeCell<AsmSlots>,
    /// Slot index + 1 of the running process; 0 when idle.
    current: AtomicUsize,
    pub queue: TicketMutex<RunQueue>,
    pub online: AtomicBool,
    pub idle_ticks: AtomicU64,
    /// A schedule IPI arrived; the idle loop rescans.
    pub ipi_schedule: AtomicBool,
    /// A TLB shootdown is pending for this core.
    pub tlb_flush_pending: AtomicBool,
    /// Slot + 1 to wake once the scheduler is off the blocking thread's
    /// kernel stack; 0 = none. See `sched::retire_and_wake`.
    pub deferred_wake: AtomicUsize,
}

// SAFETY: `asm` is only written by the core that owns this CpuLocal (the
// scheduler on that core) and read by that core's entry assembly; all
// cross-core fields are atomics or locked.
unsafe impl Sync for CpuLocal {}

impl CpuLocal {
    const fn new(id: usize) -> Self {
        Self {
            id,
            asm: UnsafeCell::new(AsmSlots {
                kernel_stack_top: 0,
                saved_user_sp: 0,
                saved_user_ip: 0,
                saved_user_flags: 0,
                saved_kernel_sp: 0,
                cpu_id: id as u64,
            }),
            current: AtomicUsize::new(0),
            queue: TicketMutex::new(RunQueue::new()),
            online: AtomicBool::new(false),
            idle_ticks: AtomicU64::new(0),
            ipi_schedule: AtomicBool::new(false),
            tlb_flush_pending: AtomicBool::new(false),
            deferred_wake: AtomicUsize::new(0),
        }
    }

    /// Currently-running process slot, if any.
    pub fn current_slot(&self) -> Option<usize> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            n => Some(n - 1),
        }
    }

    pub fn set_current(&self, slot: Option<usize>) {
        self.current
            .store(slot.map(|s| s + 1).unwrap_or(0), Ordering::Release);
    }

    /// Ready-queue depth (load metric for placement and stealing).
    pub fn load(&self) -> usize {
        self.queue.lock().len()
    }
}

static CPUS: [CpuLocal; MAX_CORES] = [
    CpuLocal::new(0),
    CpuLocal::new(1),
    CpuLocal::new(2),
    CpuLocal::new(3),
    CpuLocal::new(4),
    CpuLocal::new(5),
    CpuLocal::new(6),
    CpuLocal::new(7),
];

#[repr(C, align(16))]
struct SchedStack([u8; SCHED_STACK_SIZE]);

static SCHED_STACKS: [SchedStack; MAX_CORES] =
    [const { SchedStack([0; SCHED_STACK_SIZE]) }; MAX_CORES];

/// The CpuLocal of `core`.
pub fn cpu(core: usize) -> &'static CpuLocal {
    &CPUS[core.min(MAX_CORES - 1)]
}

/// The CpuLocal of the executing core.
pub fn this_cpu() -> &'static CpuLocal {
    cpu(crate::arch::cpu_id())
}

/// Top of `core`'s scheduler stack.
pub fn sched_stack_top(core: usize) -> u64 {
    let base = SCHED_STACKS[core.min(MAX_CORES - 1)].0.as_ptr() as u64;
    base + SCHED_STACK_SIZE as u64
}

/// Mark a core online; returns its CpuLocal for convenience.
pub fn bring_online(core: usize) -> &'static CpuLocal {
    let c = cpu(core);
    c.online.store(true, Ordering::Release);
    c
}

pub fn online_cores() -> impl Iterator<Item = &'static CpuLocal> {
    CPUS.iter().filter(|c| c.online.load(Ordering::Acquire))
}

pub fn online_count() -> usize {
    online_cores().count()
}

/// Core with the shallowest ready queue; used for spawn placement.
pub fn least_loaded_core() -> usize {
    online_cores()
        .min_by_key(|c| c.load())
        .map(|c| c.id)
        .unwrap_or(0)
}
