//! Process syscalls: spawn, exec, rfork (threads), wait, exit, sleep.

use super::copy_from_user;
use crate::{
    error::{KernelError, KernelResult, MmError},
    mm::{
        layout::{user_range_ok, ARGV_BASE, PAGE_SIZE},
        paging,
    },
    process::{fd, lifecycle, table, thread, FdKind, PendingOp, ProcState, WaitTarget},
    sched,
};

/// rfork flag: share the address space (thread creation).
const RFMEM: u64 = 1 << 0;

/// Create a thread in the caller's group. `entry`/`stack` are the new
/// thread's starting user context.
pub(super) fn rfork(slot: usize, flags: u64, entry: u64, stack: u64) -> KernelResult<u64> {
    if flags & RFMEM == 0 || entry == 0 {
        return Err(KernelError::InvalidArgument);
    }
    if !user_range_ok(entry, 1) || !user_range_ok(stack, 0) {
        return Err(KernelError::BadUserPointer { addr: entry });
    }
    let child = lifecycle::create_thread(slot, entry, stack)?;
    let pid = table::slot_pid(child);
    sched::start(child);
    Ok(pid)
}

/// Replace the calling process's image. The old user mappings stay
/// readable while the new space is built (we are still running under the
/// old root), then the process commits to the new space and resumes at
/// the new entry point.
pub(super) fn exec(slot: usize, elf_ptr: u64, elf_len: usize) -> KernelResult<u64> {
    if elf_len == 0 || !user_range_ok(elf_ptr, elf_len) {
        return Err(KernelError::BadUserPointer { addr: elf_ptr });
    }
    // SAFETY: the range was validated against the user half and the old
    // address space is active on this core for the whole load; a fault
    // on an unmapped page kills the caller, which is the documented
    // outcome for a torn exec image.
    let image = unsafe { core::slice::from_raw_parts(elf_ptr as *const u8, elf_len) };

    // SAFETY: we run `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    if proc.group.is_some() {
        // exec from a grouped thread would rip the space from under its
        // siblings.
        return Err(KernelError::InvalidArgument);
    }

    let new_root = paging::create_address_space()?;
    let loaded = match crate::elf::load(new_root, image)
        .and_then(|l| lifecycle::map_user_stack(new_root).map(|pages| (l, pages)))
    {
        Ok(v) => v,
        Err(e) => {
            paging::free_address_space(new_root);
            return Err(e);
        }
    };
    let (image_info, stack_pages) = loaded;

    // Commit: swap roots, retire the old space, reset the register save
    // area so the scheduler's first-run path enters the new image.
    let old_root = proc.space_root;
    let old_cores = proc.cores_ran_on;
    proc.space_root = new_root;
    proc.brk = image_info.brk;
    proc.mem_pages = image_info.pages_mapped + stack_pages;
    proc.regs.ip = image_info.entry;
    proc.regs.sp = crate::arch::initial_user_sp();
    proc.regs.flags = crate::arch::initial_user_flags();
    proc.fresh = true;
    proc.pending = PendingOp::None;
    proc.pending_ret = 0;
    proc.ipc_pending_msg = None;
    proc.ipc_recv_buf = 0;

    sched::tlb_shootdown(old_cores);
    paging::switch_address_space(new_root);
    paging::free_address_space(old_root);

    // Still `Running`: the scheduler loop re-enqueues us and the next
    // dispatch takes the first-run path into the new image.
    sched::schedule_next()
}

/// Reap a zombie child, blocking until one exists. `pid == 0` waits for
/// any child.
pub(super) fn wait(slot: usize, pid: u64) -> KernelResult<u64> {
    let target = if pid == 0 {
        WaitTarget::AnyChild
    } else {
        WaitTarget::Pid(pid)
    };
    if let Some((_child, status)) = lifecycle::reap_zombie(slot, target) {
        return Ok(status);
    }
    if !lifecycle::has_child(slot, target) {
        return Err(KernelError::InvalidArgument);
    }
    // SAFETY: we run `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    proc.waiting_for = Some(target);
    proc.pending = PendingOp::Wait;
    sched::block_current()
}

pub(super) fn exit(slot: usize, status: u64) -> KernelResult<u64> {
    let wake = lifecycle::exit_current(slot, status);
    sched::retire_and_wake(wake)
}

pub(super) fn sleep(slot: usize, ms: u64) -> KernelResult<u64> {
    // SAFETY: we run `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    proc.sleep_until = crate::timer::wake_tick_after_ms(ms);
    proc.pending = PendingOp::Sleep;
    sched::block_current()
}

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

/// Userspace argv descriptor: `argc` followed by `argc` (ptr, len)
/// pairs.
const ARGV_MAX: usize = 16;

/// fd map entry: (parent fd, child fd) as two u32s.
const FDMAP_MAX: usize = 8;

/// Spawn a child from an ELF image in the caller's memory.
///
/// `fd_map` duplicates chosen parent fds into chosen child slots
/// (incrementing pipe/channel refcounts); `argv` materializes at
/// [`ARGV_BASE`] in the child as `[argc][argv pointers][strings]`.
pub(super) fn spawn(
    slot: usize,
    elf_ptr: u64,
    elf_len: usize,
    fdmap_ptr: u64,
    fdmap_count: usize,
    argv_ptr: u64,
) -> KernelResult<u64> {
    if elf_len == 0 || !user_range_ok(elf_ptr, elf_len) {
        return Err(KernelError::BadUserPointer { addr: elf_ptr });
    }
    if fdmap_count > FDMAP_MAX {
        return Err(KernelError::InvalidArgument);
    }
    // SAFETY: validated range; the parent's space is active throughout.
    let image = unsafe { core::slice::from_raw_parts(elf_ptr as *const u8, elf_len) };

    let child = lifecycle::create("spawned", lifecycle::Spawner::User { parent_slot: slot })?;
    // SAFETY: creation path owns the child slot until `sched::start`.
    let child_root = unsafe { table::slot_mut(child) }.space_root;

    let built: KernelResult<()> = (|| {
        let loaded = crate::elf::load(child_root, image)?;
        let stack_pages = lifecycle::map_user_stack(child_root)?;
        let argv_top = build_argv(slot, child_root, argv_ptr)?;

        // SAFETY: as above.
        let proc = unsafe { table::slot_mut(child) };
        proc.regs.ip = loaded.entry;
        proc.regs.sp = argv_top;
        proc.brk = loaded.brk;
        proc.mem_pages = loaded.pages_mapped + stack_pages;

        copy_fd_map(slot, child, fdmap_ptr, fdmap_count)?;
        Ok(())
    })();

    if let Err(e) = built {
        // Tear the half-built child down; its space and stack free the
        // way any dead process's do.
        // SAFETY: child is still unpublished.
        let proc = unsafe { table::slot_mut(child) };
        proc.state = ProcState::Dead;
        proc.needs_stack_free = true;
        paging::free_address_space(child_root);
        proc.space_root = 0;
        return Err(e);
    }

    let pid = table::slot_pid(child);
    sched::start(child);
    Ok(pid)
}

/// Build the child's argv page. Layout at [`ARGV_BASE`]:
/// `[argc: u64][argv[0..argc]: u64 pointers][NUL-terminated strings]`.
/// Returns the initial child SP (`ARGV_BASE - 8`).
fn build_argv(parent_slot: usize, child_root: u64, argv_ptr: u64) -> KernelResult<u64> {
    let mut page = [0u8; PAGE_SIZE];
    let mut argc = 0u64;

    if argv_ptr != 0 {
        let mut header = [0u8; 8];
        copy_from_user(parent_slot, argv_ptr, &mut header)?;
        argc = u64::from_le_bytes(header).min(ARGV_MAX as u64);

        let mut strings_at = 8 + argc as usize * 8;
        for i in 0..argc {
            let mut pair = [0u8; 16];
            copy_from_user(parent_slot, argv_ptr + 8 + i * 16, &mut pair)?;
            let ptr = u64::from_le_bytes(pair[..8].try_into().expect("8-byte slice"));
            let len = u64::from_le_bytes(pair[8..].try_into().expect("8-byte slice")) as usize;

            if strings_at + len + 1 > PAGE_SIZE {
                return Err(KernelError::InvalidArgument);
            }
            copy_from_user(parent_slot, ptr, &mut page[strings_at..strings_at + len])?;
            page[strings_at + len] = 0;

            let user_ptr = ARGV_BASE + strings_at as u64;
            page[8 + i as usize * 8..16 + i as usize * 8]
                .copy_from_slice(&user_ptr.to_le_bytes());
            strings_at += len + 1;
        }
    }
    page[..8].copy_from_slice(&argc.to_le_bytes());

    paging::copy_to_space(child_root, ARGV_BASE, &page)
        .map_err(|_| KernelError::Mm(MmError::NotMapped { vaddr: ARGV_BASE }))?;
    Ok(ARGV_BASE - 8)
}

/// Duplicate requested parent fds into the child, taking the extra
/// references duplication implies.
fn copy_fd_map(
    parent_slot: usize,
    child_slot: usize,
    fdmap_ptr: u64,
    count: usize,
) -> KernelResult<()> {
    for i in 0..count {
        let mut pair = [0u8; 8];
        copy_from_user(parent_slot, fdmap_ptr + i as u64 * 8, &mut pair)?;
        let parent_fd = u32::from_le_bytes(pair[..4].try_into().expect("4-byte slice")) as usize;
        let child_fd = u32::from_le_bytes(pair[4..].try_into().expect("4-byte slice")) as usize;

        let kind = thread::with_fds(parent_slot, |fds| fds.get(parent_fd))
            .ok_or(KernelError::BadFd { fd: parent_fd })?;
        // SAFETY: child is unpublished; its inline fd table is ours.
        let child = unsafe { table::slot_mut(child_slot) };
        if matches!(kind, FdKind::Ipc { .. } | FdKind::Pipe { .. })
            && !child.quotas.allows_channel_refs(child.fds.channel_refs(), 1)
        {
            return Err(KernelError::QuotaExceeded {
                resource: "channels",
            });
        }
        fd::retain_kind(&kind);
        if !child.fds.install(child_fd, kind) {
            fd::release_kind(&kind);
            return Err(KernelError::BadFd { fd: child_fd });
        }
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn argv_layout_constants_hold() {
        // The argv page is the top stack page; SP starts just below it.
        assert_eq!(ARGV_BASE % PAGE_SIZE as u64, 0);
        assert_eq!(
            crate::mm::layout::USER_STACK_TOP - ARGV_BASE,
            PAGE_SIZE as u64
        );
    }

    #[test]
    fn rfork_requires_shared_memory_flag() {
        assert_eq!(RFMEM, 1);
    }
}
