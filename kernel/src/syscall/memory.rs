//! Memory syscalls.

use crate::{
    error::KernelResult,
    mm::{
        layout::{page_align_up, user_range_ok, PAGE_SIZE},
        paging::{self, MapFlags},
        pmm,
    },
    process::table,
};

/// Grow the heap break. `brk(0)` reports the current break; growth maps
/// zeroed pages up to the new break. Quota or frame exhaustion returns
/// the old break unchanged, which is the error signal of this ABI.
pub(super) fn brk(slot: usize, addr: u64) -> KernelResult<u64> {
    // SAFETY: we run `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    let old = proc.brk;
    if addr == 0 || addr <= old || !user_range_ok(addr, 0) {
        return Ok(old);
    }

    let root = proc.effective_root();
    let first_new = page_align_up(old);
    let end = page_align_up(addr);
    let new_pages = ((end - first_new) / PAGE_SIZE as u64) as usize;

    if proc
        .mem_pages
        .checked_add(new_pages)
        .is_none_or(|total| total > proc.quotas.max_memory_pages)
    {
        return Ok(old);
    }

    let mut mapped = 0;
    let mut page = first_new;
    while page < end {
        let frame = match pmm::alloc_page() {
            Ok(f) => f,
            Err(_) => break,
        };
        paging::zero_frame(frame);
        if paging::map_page(
            root,
            page,
            frame,
            MapFlags::USER | MapFlags::WRITABLE | MapFlags::NO_EXECUTE,
        )
        .is_err()
        {
            pmm::free_page(frame);
            break;
        }
        mapped += 1;
        page += PAGE_SIZE as u64;
    }

    if mapped < new_pages {
        // Partial growth: roll the fresh pages back and report the old
        // break.
        let mut page = first_new;
        for _ in 0..mapped {
            if let Ok(frame) = paging::unmap_page(root, page) {
                pmm::free_page(frame);
            }
            page += PAGE_SIZE as u64;
        }
        return Ok(old);
    }

    proc.mem_pages += new_pages;
    proc.brk = addr;
    Ok(addr)
}
