//! File descriptor tables.
//!
//! An fd is a tagged handle; dispatch across kinds is a closed enum and
//! exhaustive `match`, never dynamic. Pipe fds carry a reference on the
//! pipe end they name; IPC fds carry a reference on their channel.

use crate::ipc::{channel, pipe};

/// Entries per fd table.
pub const MAX_FDS: usize = 32;

/// Network fd sub-kinds. The network stack itself is a userspace server;
/// the kernel only tags the fds it hands out for `/net` paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetKind {
    Tcp,
    Udp,
    Icmp,
    Dns,
}

/// What an fd names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// A channel endpoint. `server_handle` is assigned by the server on
    /// open; `read_offset` is maintained by the kernel.
    Ipc {
        channel: u32,
        server_side: bool,
        server_handle: u32,
        read_offset: u32,
    },
    /// One end of a pipe.
    Pipe { pipe: u32, write_end: bool },
    /// A network connection index, serviced externally.
    Net { kind: NetKind, conn: u32 },
    /// The raw block device.
    Blk,
    /// Process info pseudo-file.
    Proc,
    DevNull,
    DevZero,
    DevRandom,
    DevCpu,
    /// Bus/input pseudo-files, claimed by userspace drivers.
    DevPci,
    DevUsb,
    DevMouse,
}

/// A process (or thread group) fd table.
pub struct FdTable {
    entries: [Option<FdKind>; MAX_FDS],
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_FDS],
        }
    }

    /// Claim the lowest free slot.
    pub fn alloc(&mut self, kind: FdKind) -> Option<usize> {
        let fd = self.entries.iter().position(|e| e.is_none())?;
        self.entries[fd] = Some(kind);
        Some(fd)
    }

    pub fn get(&self, fd: usize) -> Option<FdKind> {
        self.entries.get(fd).copied().flatten()
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut FdKind> {
        self.entries.get_mut(fd).and_then(|e| e.as_mut())
    }

    /// Install `kind` at a specific slot (spawn fd mapping), dropping any
    /// previous entry's reference.
    pub fn install(&mut self, fd: usize, kind: FdKind) -> bool {
        if fd >= MAX_FDS {
            return false;
        }
        if let Some(old) = self.entries[fd].take() {
            release_kind(&old);
        }
        self.entries[fd] = Some(kind);
        true
    }

    /// Remove an entry without touching refcounts (callers that forward
    /// the entry elsewhere).
    pub fn take(&mut self, fd: usize) -> Option<FdKind> {
        self.entries.get_mut(fd).and_then(|e| e.take())
    }

    pub fn iter_used(&self) -> impl Iterator<Item = (usize, FdKind)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(fd, e)| e.map(|k| (fd, k)))
    }

    /// Entries holding channel or pipe references: the unit the
    /// `max_channels` quota bounds.
    pub fn channel_refs(&self) -> usize {
        self.iter_used()
            .filter(|(_, k)| matches!(k, FdKind::Ipc { .. } | FdKind::Pipe { .. }))
            .count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Take a reference for a duplicated fd entry (spawn inheritance).
pub fn retain_kind(kind: &FdKind) {
    match kind {
        FdKind::Ipc { channel, .. } => channel::retain(*channel as usize),
        FdKind::Pipe { pipe, write_end } => pipe::retain(*pipe as usize, *write_end),
        _ => {}
    }
}

/// Release the reference an fd entry holds. Pipe wakes are the caller's
/// job: `pipe::close_end` reports who to wake.
pub fn release_kind(kind: &FdKind) {
    match kind {
        FdKind::Ipc { channel, .. } => channel::release(*channel as usize),
        FdKind::Pipe { pipe, write_end } => {
            let mut woken = [0u64; pipe::PIPE_WAITERS];
            let n = pipe::close_end(*pipe as usize, *write_end, &mut woken);
            for &pid in &woken[..n] {
                crate::sched::wake_pid(pid);
            }
        }
        _ => {}
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_lowest_free() {
        let mut t = FdTable::new();
        assert_eq!(t.alloc(FdKind::DevNull), Some(0));
        assert_eq!(t.alloc(FdKind::DevZero), Some(1));
        t.take(0);
        assert_eq!(t.alloc(FdKind::Blk), Some(0));
    }

    #[test]
    fn table_fills_at_capacity() {
        let mut t = FdTable::new();
        for _ in 0..MAX_FDS {
            assert!(t.alloc(FdKind::DevNull).is_some());
        }
        assert_eq!(t.alloc(FdKind::DevNull), None);
    }

    #[test]
    fn install_at_fixed_slot() {
        let mut t = FdTable::new();
        assert!(t.install(5, FdKind::Proc));
        assert_eq!(t.get(5), Some(FdKind::Proc));
        assert!(!t.install(MAX_FDS, FdKind::Proc));
    }

    #[test]
    fn iter_used_skips_holes() {
        let mut t = FdTable::new();
        t.install(1, FdKind::DevNull);
        t.install(4, FdKind::Blk);
        let used: std::vec::Vec<_> = t.iter_used().collect();
        assert_eq!(used.len(), 2);
        assert_eq!(used[0].0, 1);
        assert_eq!(used[1].0, 4);
    }

    #[test]
    fn channel_refs_counts_only_channel_backed_fds() {
        let mut t = FdTable::new();
        t.install(0, FdKind::DevNull);
        t.install(
            1,
            FdKind::Ipc {
                channel: 3,
                server_side: false,
                server_handle: 0,
                read_offset: 0,
            },
        );
        t.install(
            2,
            FdKind::Pipe {
                pipe: 1,
                write_end: true,
            },
        );
        t.install(3, FdKind::Blk);
        assert_eq!(t.channel_refs(), 2);
    }
}
