//! Informational syscalls and shutdown.

use super::copy_to_user;
use crate::{error::KernelResult, mm::pmm};

/// The struct `sysinfo` writes to userspace.
#[repr(C)]
struct SysInfo {
    total_pages: u64,
    free_pages: u64,
    page_size: u64,
}

pub(super) fn sysinfo(slot: usize, ptr: u64) -> KernelResult<u64> {
    let stats = pmm::stats();
    let info = SysInfo {
        total_pages: stats.total_frames as u64,
        free_pages: stats.free_frames as u64,
        page_size: crate::mm::PAGE_SIZE as u64,
    };
    // SAFETY: SysInfo is repr(C) plain integers.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            (&info as *const SysInfo).cast::<u8>(),
            core::mem::size_of::<SysInfo>(),
        )
    };
    copy_to_user(slot, ptr, bytes)?;
    Ok(0)
}

/// Copy a window of the kernel log. The caller passes its stream offset;
/// the kernel clamps to the earliest byte still buffered. Returns bytes
/// copied; the clamped offset advances implicitly (callers track their
/// own position by adding the return value to the offset they passed).
pub(super) fn klog_read(slot: usize, offset: u64, buf: u64, len: usize) -> KernelResult<u64> {
    let mut done = 0usize;
    let mut chunk = [0u8; 256];
    let mut at = offset;
    while done < len {
        let want = (len - done).min(chunk.len());
        let (start, n) = crate::klog::read_window(at, &mut chunk[..want]);
        if n == 0 {
            break;
        }
        copy_to_user(slot, buf + done as u64, &chunk[..n])?;
        at = start + n as u64;
        done += n;
    }
    Ok(done as u64)
}

/// Power off (flag 0) or reboot (flag 1). Noreturn.
pub(super) fn shutdown(flags: u64) -> KernelResult<u64> {
    log::info!(target: "kernel", "shutdown requested (flags {:#x})", flags);
    crate::arch::shutdown(flags & 1 != 0)
}
