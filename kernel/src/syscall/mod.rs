//! Syscall dispatch.
//!
//! The architecture entry stub snapshots the user context into the
//! calling process (so any handler may block and schedule away), then
//! calls [`dispatch`]. Non-blocking handlers return a value that the
//! stub places in the return register; blocking handlers record their
//! continuation in `PendingOp`, mark the caller blocked, and never
//! return -- the scheduler's post-switch hook finishes the operation.

mod file;
mod info;
mod memory;
mod process;

use crate::{
    error::{Errno, KernelError, KernelResult},
    mm::{layout, paging},
    process::table,
    sched,
};

/// Syscall numbers; fixed ABI.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Open = 0,
    Create = 1,
    Read = 2,
    Write = 3,
    Close = 4,
    Stat = 5,
    Seek = 6,
    Remove = 7,
    Mount = 8,
    Bind = 9,
    Unmount = 10,
    Rfork = 11,
    Exec = 12,
    Wait = 13,
    Exit = 14,
    Pipe = 15,
    Brk = 16,
    IpcRecv = 17,
    IpcReply = 18,
    Spawn = 19,
    Pread = 20,
    Pwrite = 21,
    Klog = 22,
    Sysinfo = 23,
    Sleep = 24,
    Shutdown = 25,
}

impl Syscall {
    pub fn from_u64(nr: u64) -> Option<Self> {
        if nr > Self::Shutdown as u64 {
            return None;
        }
        // SAFETY: repr(u64) with contiguous discriminants 0..=25, and the
        // range was just checked.
        Some(unsafe { core::mem::transmute::<u64, Syscall>(nr) })
    }
}

/// Top-level dispatch. Called with the user context already snapshotted.
pub fn dispatch(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> u64 {
    let Some(slot) = sched::current_slot() else {
        return Errno::Enosys.as_u64();
    };
    let Some(syscall) = Syscall::from_u64(nr) else {
        return Errno::Enosys.as_u64();
    };

    let result = match syscall {
        Syscall::Open => file::open(slot, a0, a1 as usize),
        Syscall::Create => file::create(slot, a0, a1 as usize, a2 as u32),
        Syscall::Read => file::read(slot, a0 as usize, a1, a2 as usize),
        Syscall::Write => file::write(slot, a0 as usize, a1, a2 as usize),
        Syscall::Close => file::close(slot, a0 as usize),
        Syscall::Stat => file::stat(slot, a0, a1 as usize, a2),
        Syscall::Seek => file::seek(slot, a0 as usize, a1, a2),
        Syscall::Remove => file::remove(slot, a0, a1 as usize),
        Syscall::Mount => file::mount(slot, a0, a1 as usize, a2 as usize, a3 as u32),
        Syscall::Bind => file::bind(slot, a0, a1 as usize, a2, a3 as usize, a4 as u32),
        Syscall::Unmount => file::unmount(slot, a0, a1 as usize),
        Syscall::Rfork => process::rfork(slot, a0, a1, a2),
        Syscall::Exec => process::exec(slot, a0, a1 as usize),
        Syscall::Wait => process::wait(slot, a0),
        Syscall::Exit => process::exit(slot, a0),
        Syscall::Pipe => file::pipe(slot, a0),
        Syscall::Brk => memory::brk(slot, a0),
        Syscall::IpcRecv => file::ipc_recv(slot, a0 as usize, a1),
        Syscall::IpcReply => file::ipc_reply(slot, a0 as usize, a1),
        Syscall::Spawn => process::spawn(slot, a0, a1 as usize, a2, a3 as usize, a4),
        Syscall::Pread => file::pread(slot, a0 as usize, a1, a2 as usize, a3),
        Syscall::Pwrite => file::pwrite(slot, a0 as usize, a1, a2 as usize, a3),
        Syscall::Klog => info::klog_read(slot, a0, a1, a2 as usize),
        Syscall::Sysinfo => info::sysinfo(slot, a0),
        Syscall::Sleep => process::sleep(slot, a0),
        Syscall::Shutdown => info::shutdown(a0),
    };

    match result {
        Ok(v) => v,
        Err(e) => Errno::from(e).as_u64(),
    }
}

// ---------------------------------------------------------------------------
// User memory helpers
// ---------------------------------------------------------------------------

/// Validate and copy bytes in from the caller's user half.
pub fn copy_from_user(slot: usize, va: u64, buf: &mut [u8]) -> KernelResult<()> {
    if !layout::user_range_ok(va, buf.len()) {
        return Err(KernelError::BadUserPointer { addr: va });
    }
    // SAFETY: this core runs `slot`; effective_root is its live space.
    let root = unsafe { table::slot_mut(slot) }.effective_root();
    paging::copy_from_space(root, va, buf).map_err(|_| KernelError::BadUserPointer { addr: va })
}

/// Validate and copy bytes out to the caller's user half.
pub fn copy_to_user(slot: usize, va: u64, bytes: &[u8]) -> KernelResult<()> {
    if !layout::user_range_ok(va, bytes.len()) {
        return Err(KernelError::BadUserPointer { addr: va });
    }
    // SAFETY: as in `copy_from_user`.
    let root = unsafe { table::slot_mut(slot) }.effective_root();
    paging::copy_to_space(root, va, bytes).map_err(|_| KernelError::BadUserPointer { addr: va })
}

/// Copy a user path into `buf` and hand back the `&str`.
pub fn read_user_path<'a>(
    slot: usize,
    ptr: u64,
    len: usize,
    buf: &'a mut [u8; 256],
) -> KernelResult<&'a str> {
    if len == 0 || len > buf.len() {
        return Err(KernelError::InvalidArgument);
    }
    copy_from_user(slot, ptr, &mut buf[..len])?;
    core::str::from_utf8(&buf[..len]).map_err(|_| KernelError::InvalidArgument)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_are_abi_stable() {
        assert_eq!(Syscall::from_u64(0), Some(Syscall::Open));
        assert_eq!(Syscall::from_u64(12), Some(Syscall::Exec));
        assert_eq!(Syscall::from_u64(19), Some(Syscall::Spawn));
        assert_eq!(Syscall::from_u64(25), Some(Syscall::Shutdown));
        assert_eq!(Syscall::from_u64(26), None);
    }
}
