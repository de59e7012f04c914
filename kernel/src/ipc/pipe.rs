//! Ring-buffer pipes.
//!
//! Fixed table of pipes, each a 4 KiB ring with independently refcounted
//! read and write ends and bounded waiter lists for blocked peers. Byte
//! delivery to a blocked thread happens in the scheduler's post-switch
//! hook; this module only reports who must be woken.

use crate::{
    error::{IpcError, KernelResult},
    sync::{TicketGuard, TicketLock, TicketMutex},
};

/// System-wide pipe table size.
pub const MAX_PIPES: usize = 32;

/// Ring capacity in bytes.
pub const PIPE_BUF_SIZE: usize = 4096;

/// Blocked threads remembered per side. When the list is full the first
/// slot is overwritten; wakers re-validate pids, so the displaced waiter
/// is re-woken by the next transfer.
pub const PIPE_WAITERS: usize = 4;

/// Result of a read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes copied out.
    Bytes(usize),
    /// Ring empty but writers exist; caller must block.
    WouldBlock,
    /// Ring drained and no writers remain.
    Eof,
}

/// Result of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Bytes copied in.
    Bytes(usize),
    /// Ring full but readers exist; caller must block.
    WouldBlock,
    /// No readers remain.
    Broken,
}

/// Bounded list of blocked pids.
#[derive(Debug, Clone, Copy)]
pub struct WaiterList {
    pids: [Option<u64>; PIPE_WAITERS],
}

impl WaiterList {
    const fn new() -> Self {
        Self {
            pids: [None; PIPE_WAITERS],
        }
    }

    /// Record a waiter. Overwrites slot 0 when full (see const docs).
    pub fn add(&mut self, pid: u64) {
        for slot in self.pids.iter_mut() {
            if slot.is_none() || *slot == Some(pid) {
                *slot = Some(pid);
                return;
            }
        }
        self.pids[0] = Some(pid);
    }

    /// Drain all waiters into `out`, returning how many there were.
    pub fn drain(&mut self, out: &mut [u64; PIPE_WAITERS]) -> usize {
        let mut n = 0;
        for slot in self.pids.iter_mut() {
            if let Some(pid) = slot.take() {
                out[n] = pid;
                n += 1;
            }
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.pids.iter().all(|s| s.is_none())
    }
}

/// One pipe: ring plus end refcounts and waiter lists.
pub struct Pipe {
    pub active: bool,
    buf: [u8; PIPE_BUF_SIZE],
    head: usize,
    count: usize,
    /// Open read ends (fd duplication increments).
    pub readers: u32,
    /// Open write ends.
    pub writers: u32,
    pub read_waiters: WaiterList,
    pub write_waiters: WaiterList,
}

impl Pipe {
    const fn new() -> Self {
        Self {
            active: false,
            buf: [0; PIPE_BUF_SIZE],
            head: 0,
            count: 0,
            readers: 0,
            writers: 0,
            read_waiters: WaiterList::new(),
            write_waiters: WaiterList::new(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.count
    }

    /// Copy up to `out.len()` bytes from the ring.
    pub fn read(&mut self, out: &mut [u8]) -> ReadOutcome {
        if self.count == 0 {
            return if self.writers == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::WouldBlock
            };
        }
        let n = out.len().min(self.count);
        for slot in out.iter_mut().take(n) {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % PIPE_BUF_SIZE;
            self.count -= 1;
        }
        ReadOutcome::Bytes(n)
    }

    /// Copy up to `data.len()` bytes into the ring (partial writes allowed).
    pub fn write(&mut self, data: &[u8]) -> WriteOutcome {
        if self.readers == 0 {
            return WriteOutcome::Broken;
        }
        let space = PIPE_BUF_SIZE - self.count;
        if space == 0 {
            return WriteOutcome::WouldBlock;
        }
        let n = data.len().min(space);
        let mut tail = (self.head + self.count) % PIPE_BUF_SIZE;
        for &b in data.iter().take(n) {
            self.buf[tail] = b;
            tail = (tail + 1) % PIPE_BUF_SIZE;
        }
        self.count += n;
        WriteOutcome::Bytes(n)
    }
}

static PIPES: [TicketMutex<Pipe>; MAX_PIPES] = [const { TicketMutex::new(Pipe::new()) }; MAX_PIPES];

static ALLOC_LOCK: TicketLock = TicketLock::new();

/// Allocate a pipe with one reader and one writer reference.
pub fn create() -> KernelResult<usize> {
    ALLOC_LOCK.lock();
    let mut found = None;
    for (id, slot) in PIPES.iter().enumerate() {
        let mut p = slot.lock();
        if !p.active {
            *p = Pipe::new();
            p.active = true;
            p.readers = 1;
            p.writers = 1;
            found = Some(id);
            break;
        }
    }
    ALLOC_LOCK.unlock();
    found.ok_or_else(|| IpcError::NoFreePipes.into())
}

/// Lock pipe `id`.
pub fn lock(id: usize) -> KernelResult<TicketGuard<'static, Pipe>> {
    if id >= MAX_PIPES {
        return Err(IpcError::BadChannel { id }.into());
    }
    let p = PIPES[id].lock();
    if !p.active {
        return Err(IpcError::BadChannel { id }.into());
    }
    Ok(p)
}

/// Duplicate one end (spawn fd inheritance).
pub fn retain(id: usize, write_end: bool) {
    if let Ok(mut p) = lock(id) {
        if write_end {
            p.writers += 1;
        } else {
            p.readers += 1;
        }
    }
}

/// Close one end. Returns the pids to wake on the opposite side (their
/// blocking condition may have changed to EOF / broken pipe); the slot is
/// freed once both counts reach zero.
pub fn close_end(id: usize, write_end: bool, woken: &mut [u64; PIPE_WAITERS]) -> usize {
    let Ok(mut p) = lock(id) else {
        return 0;
    };
    let n = if write_end {
        p.writers = p.writers.saturating_sub(1);
        if p.writers == 0 {
            p.read_waiters.drain(woken)
        } else {
            0
        }
    } else {
        p.readers = p.readers.saturating_sub(1);
        if p.readers == 0 {
            p.write_waiters.drain(woken)
        } else {
            0
        }
    };
    if p.readers == 0 && p.writers == 0 {
        p.active = false;
    }
    n
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn open_pipe() -> Pipe {
        let mut p = Pipe::new();
        p.active = true;
        p.readers = 1;
        p.writers = 1;
        p
    }

    #[test]
    fn bytes_round_trip_in_order() {
        let mut p = open_pipe();
        assert_eq!(p.write(b"abcdefgh"), WriteOutcome::Bytes(8));
        let mut out = [0u8; 8];
        assert_eq!(p.read(&mut out), ReadOutcome::Bytes(8));
        assert_eq!(&out, b"abcdefgh");
    }

    #[test]
    fn conservation_across_wraparound() {
        let mut p = open_pipe();
        let chunk = [1u8; 3000];
        let mut sink = [0u8; 3000];
        // Push the ring through several wraparounds.
        for _ in 0..5 {
            assert_eq!(p.write(&chunk), WriteOutcome::Bytes(3000));
            assert_eq!(p.buffered(), 3000);
            assert_eq!(p.read(&mut sink), ReadOutcome::Bytes(3000));
            assert_eq!(p.buffered(), 0);
        }
    }

    #[test]
    fn empty_pipe_blocks_or_eofs() {
        let mut p = open_pipe();
        let mut out = [0u8; 4];
        assert_eq!(p.read(&mut out), ReadOutcome::WouldBlock);
        p.writers = 0;
        assert_eq!(p.read(&mut out), ReadOutcome::Eof);
    }

    #[test]
    fn eof_only_after_drain() {
        let mut p = open_pipe();
        p.write(b"xy");
        p.writers = 0;
        let mut out = [0u8; 8];
        assert_eq!(p.read(&mut out), ReadOutcome::Bytes(2));
        assert_eq!(p.read(&mut out), ReadOutcome::Eof);
    }

    #[test]
    fn writes_partial_then_block_then_broken() {
        let mut p = open_pipe();
        let big = [9u8; PIPE_BUF_SIZE + 64];
        assert_eq!(p.write(&big), WriteOutcome::Bytes(PIPE_BUF_SIZE));
        assert_eq!(p.write(b"more"), WriteOutcome::WouldBlock);
        p.readers = 0;
        assert_eq!(p.write(b"more"), WriteOutcome::Broken);
    }

    #[test]
    fn waiter_list_overwrites_first_slot_when_full() {
        let mut w = WaiterList::new();
        for pid in 1..=PIPE_WAITERS as u64 {
            w.add(pid);
        }
        w.add(99);
        let mut out = [0u64; PIPE_WAITERS];
        let n = w.drain(&mut out);
        assert_eq!(n, PIPE_WAITERS);
        assert!(out[..n].contains(&99));
        assert!(!out[..n].contains(&1));
        assert!(w.is_empty());
    }

    #[test]
    fn duplicate_waiter_is_stored_once() {
        let mut w = WaiterList::new();
        w.add(5);
        w.add(5);
        let mut out = [0u64; PIPE_WAITERS];
        assert_eq!(w.drain(&mut out), 1);
    }
}
