//! Processes and threads.
//!
//! A process is the scheduling unit: one kernel stack, one register save
//! area, an fd table and a namespace (possibly shared through a thread
//! group), and a pending-operation slot that records why it is blocked
//! and how to finish its syscall when it next runs.

pub mod fd;
pub mod lifecycle;
pub mod table;
pub mod thread;

pub use fd::{FdKind, FdTable, MAX_FDS};
pub use table::{MAX_PROCESSES, NO_PID};

use crate::{
    fs::namespace::Namespace,
    ipc::message::Message,
    mm::layout::KERNEL_STACK_PAGES,
};

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Slot unused.
    Free,
    /// On a run queue.
    Ready,
    /// Executing on some core.
    Running,
    /// Parked on a resource; `pending` says which.
    Blocked,
    /// Exited, waiting to be reaped by the parent.
    Zombie,
    /// Killed; slot is reclaimable.
    Dead,
}

/// Why a blocked thread is parked, plus the continuation state needed to
/// finish its syscall from the scheduler's post-switch hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    None,
    /// `open` sent `t_open`; fd pre-allocated.
    Open { fd: usize },
    /// `create` sent `t_create`; fd pre-allocated.
    Create { fd: usize },
    /// Server-backed `read`; reply bytes land in `buf`.
    Read { fd: usize, buf: u64, len: usize },
    /// Server-backed `write` of `len` bytes.
    Write { fd: usize, len: usize },
    /// Server-backed `close`.
    Close { fd: usize },
    /// `stat`; reply bytes (≤64) land in `buf`.
    Stat { buf: u64, len: usize },
    /// `remove`.
    Remove,
    /// fd 0 read with no console data yet.
    ConsoleRead { buf: u64, len: usize },
    /// Network reads; serviced by an external stack, absent here.
    NetRead { buf: u64, len: usize },
    IcmpRead { buf: u64, len: usize },
    NetConnect,
    NetListen,
    DnsQuery,
    /// Pipe read on an empty ring.
    PipeRead { pipe: usize, buf: u64, len: usize },
    /// Pipe write on a full ring.
    PipeWrite { pipe: usize, buf: u64, len: usize },
    /// `sleep` until `sleep_until`.
    Sleep,
    /// `ipc_recv` with no message pending.
    IpcRecv { channel: usize, buf: u64 },
    /// `wait` with no zombie child yet.
    Wait,
}

/// Saved user context. Filled on every syscall entry so that any handler
/// can decide to block and schedule away.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserRegs {
    pub ip: u64,
    pub sp: u64,
    pub flags: u64,
    /// Kernel stack pointer at the syscall frame; the resume path writes
    /// the return value into this frame.
    pub saved_kernel_sp: u64,
}

/// Per-process resource quotas, applied by containers.
#[derive(Debug, Clone, Copy)]
pub struct ResourceQuotas {
    pub max_memory_pages: usize,
    pub max_channels: usize,
    pub max_children: usize,
    pub cpu_priority: u8,
}

impl ResourceQuotas {
    pub const fn unlimited() -> Self {
        Self {
            max_memory_pages: usize::MAX,
            max_channels: usize::MAX,
            max_children: usize::MAX,
            cpu_priority: 0,
        }
    }

    /// May a process already holding `held` channel/pipe references take
    /// `additional` more?
    pub fn allows_channel_refs(&self, held: usize, additional: usize) -> bool {
        held.checked_add(additional)
            .is_some_and(|total| total <= self.max_channels)
    }

    /// May a process with `children` live children have one more?
    pub fn allows_child(&self, children: usize) -> bool {
        children < self.max_children
    }
}

/// What `wait` is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    AnyChild,
    Pid(u64),
}

/// The process control block.
pub struct Process {
    pub pid: u64,
    pub state: ProcState,
    pub parent_pid: u64,
    /// Root table of the address space; 0 when none. When `group` is set
    /// the group's shared root is authoritative.
    pub space_root: u64,
    /// Base of the contiguous kernel stack frames.
    pub kstack_phys: u64,
    pub regs: UserRegs,
    /// True until the first return to userspace (selects the iretq/sret
    /// path over the kernel-frame resume path).
    pub fresh: bool,
    pub fds: FdTable,
    pub ns: Namespace,
    pub brk: u64,
    pub quotas: ResourceQuotas,
    /// User pages currently mapped (quota accounting).
    pub mem_pages: usize,
    pub children: usize,
    pub pending: PendingOp,
    /// Return value staged by a waker that fully resolved the blocked
    /// operation (open reply, net wakeups); consumed by the post-switch
    /// hook when `pending` is back to `None`.
    pub pending_ret: u64,
    /// Outgoing IPC request; lives here until the receiver copies it.
    pub ipc_msg: Message,
    /// Deferred inbound delivery, consumed by the post-switch hook.
    pub ipc_pending_msg: Option<Message>,
    /// User buffer registered by `ipc_recv`.
    pub ipc_recv_buf: u64,
    pub assigned_core: usize,
    /// Pinned core, if any.
    pub core_affinity: Option<usize>,
    /// Bitmap of cores that ever loaded this address space; directs TLB
    /// shootdowns.
    pub cores_ran_on: u64,
    pub sleep_until: u64,
    pub vt: usize,
    pub uid: u32,
    pub gid: u32,
    pub fs_base: u64,
    /// Thread group index, if this process shares one.
    pub group: Option<usize>,
    pub waiting_for: Option<WaitTarget>,
    pub exit_status: u64,
    /// Kernel stack free deferred to the reaper (a thread cannot free the
    /// stack it is running on).
    pub needs_stack_free: bool,
    name: [u8; 32],
    name_len: u8,
}

impl Process {
    pub const fn empty() -> Self {
        Self {
            pid: 0,
            state: ProcState::Free,
            parent_pid: 0,
            space_root: 0,
            kstack_phys: 0,
            regs: UserRegs {
                ip: 0,
                sp: 0,
                flags: 0,
                saved_kernel_sp: 0,
            },
            fresh: true,
            fds: FdTable::new(),
            ns: Namespace::new(),
            brk: 0,
            quotas: ResourceQuotas::unlimited(),
            mem_pages: 0,
            children: 0,
            pending: PendingOp::None,
            pending_ret: 0,
            ipc_msg: Message::new(crate::ipc::message::MsgTag::ROk),
            ipc_pending_msg: None,
            ipc_recv_buf: 0,
            assigned_core: 0,
            core_affinity: None,
            cores_ran_on: 0,
            sleep_until: 0,
            vt: 0,
            uid: 0,
            gid: 0,
            fs_base: 0,
            group: None,
            waiting_for: None,
            exit_status: 0,
            needs_stack_free: false,
            name: [0; 32],
            name_len: 0,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let mut n = name.len().min(self.name.len());
        while n > 0 && !name.is_char_boundary(n) {
            n -= 1;
        }
        self.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        self.name_len = n as u8;
    }

    pub fn name(&self) -> &str {
        // SAFETY: `set_name` is the only writer and truncates its &str
        // input on a char boundary, so the stored bytes are valid UTF-8.
        unsafe { core::str::from_utf8_unchecked(&self.name[..self.name_len as usize]) }
    }

    /// Kernel stack top (direct-map virtual), for syscall entry.
    pub fn kstack_top(&self) -> u64 {
        crate::mm::layout::phys_to_virt(
            self.kstack_phys + (KERNEL_STACK_PAGES * crate::mm::PAGE_SIZE) as u64,
        )
    }

    pub fn is_alive(&self) -> bool {
        !matches!(
            self.state,
            ProcState::Free | ProcState::Zombie | ProcState::Dead
        )
    }

    /// The address space this process actually runs under: the group's
    /// shared root when grouped, its own otherwise.
    pub fn effective_root(&self) -> u64 {
        match self.group {
            Some(g) => thread::group_root(g).unwrap_or(self.space_root),
            None => self.space_root,
        }
    }
}
