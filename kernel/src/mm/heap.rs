//! Kernel heap: a grow-only bump arena over the PMM.
//!
//! Holds kernel init structures whose lifetime equals the kernel's, so
//! there is no free path at all. `dealloc` is a no-op. The arena starts
//! at 64 pages and extends itself with further contiguous allocations;
//! if the PMM hands back pages that are not adjacent to the arena end,
//! they are returned and the allocation fails.

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

use crate::{
    error::{KernelResult, MmError},
    mm::{
        layout::{phys_to_virt, virt_to_phys, PAGE_SIZE},
        pmm,
    },
};

/// Pages claimed at init.
const INITIAL_PAGES: usize = 64;

#[derive(Default)]
struct BumpArena {
    /// Direct-map virtual address of the arena start.
    start: u64,
    /// One past the last usable byte.
    end: u64,
    /// Next allocation cursor.
    next: u64,
}

impl BumpArena {
    fn from_range(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            next: start,
        }
    }

    fn alloc(&mut self, size: usize, align: usize) -> Option<u64> {
        if self.start == 0 {
            return None;
        }
        let aligned = self.next.checked_add(align as u64 - 1)? & !(align as u64 - 1);
        let new_next = aligned.checked_add(size as u64)?;
        if new_next > self.end && !self.grow(new_next - self.end) {
            return None;
        }
        self.next = new_next;
        Some(aligned)
    }

    /// Extend the arena by at least `need` bytes. The new pages must land
    /// directly after the current end; anything else goes straight back.
    fn grow(&mut self, need: u64) -> bool {
        let pages = (need as usize).div_ceil(PAGE_SIZE);
        let Ok(phys) = pmm::alloc_contiguous_pages(pages) else {
            return false;
        };
        if phys_to_virt(phys) != self.end {
            pmm::free_contiguous_pages(phys, pages);
            return false;
        }
        self.end += (pages * PAGE_SIZE) as u64;
        true
    }

    fn used(&self) -> u64 {
        self.next - self.start
    }
}

static ARENA: Mutex<BumpArena> = Mutex::new(BumpArena {
    start: 0,
    end: 0,
    next: 0,
});

/// Claim the initial arena pages. Must run after `pmm::init`.
pub fn init() -> KernelResult<()> {
    let phys = pmm::alloc_contiguous_pages(INITIAL_PAGES)?;
    let start = phys_to_virt(phys);
    *ARENA.lock() = BumpArena::from_range(start, start + (INITIAL_PAGES * PAGE_SIZE) as u64);
    log::info!(target: "mm", "heap: {} KiB arena at {:#x}", INITIAL_PAGES * PAGE_SIZE / 1024, phys);
    Ok(())
}

/// Allocate from the arena. There is no matching free.
pub fn alloc(size: usize, align: usize) -> KernelResult<u64> {
    ARENA
        .lock()
        .alloc(size, align)
        .ok_or_else(|| MmError::HeapExhausted.into())
}

/// Bytes handed out so far.
pub fn used_bytes() -> u64 {
    ARENA.lock().used()
}

/// The arena as the kernel's `#[global_allocator]`.
pub struct KernelHeap;

// SAFETY: alloc returns either a pointer to `layout.size()` bytes with
// `layout.align()` alignment carved out of the arena (never handed out
// twice: the cursor only moves forward under the arena mutex) or null.
// dealloc intentionally leaks; the arena is documented grow-only and is
// used for init-lifetime structures.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ARENA
            .lock()
            .alloc(layout.size(), layout.align())
            .map(|a| a as *mut u8)
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {}
}

/// Free pages left unreported: the arena owns its frames until shutdown,
/// so `sysinfo` totals come from the PMM, not from here.
pub fn arena_phys_base() -> u64 {
    let arena = ARENA.lock();
    if arena.start == 0 {
        0
    } else {
        virt_to_phys(arena.start)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn leaked_arena(bytes: usize) -> BumpArena {
        let buf = std::boxed::Box::leak(std::vec![0u8; bytes].into_boxed_slice());
        let start = buf.as_ptr() as u64;
        BumpArena::from_range(start, start + bytes as u64)
    }

    #[test]
    fn bump_advances_and_aligns() {
        let mut arena = leaked_arena(4096);
        let a = arena.alloc(10, 8).expect("first alloc");
        let b = arena.alloc(16, 64).expect("aligned alloc");
        assert_eq!(a % 8, 0);
        assert_eq!(b % 64, 0);
        assert!(b >= a + 10);
        assert_eq!(arena.used(), b + 16 - arena.start);
    }

    #[test]
    fn exhaustion_fails_when_growth_impossible() {
        // The global PMM is uninitialized in tests, so growth always fails
        // and the arena is bounded by its initial range.
        let mut arena = leaked_arena(256);
        assert!(arena.alloc(200, 8).is_some());
        assert!(arena.alloc(200, 8).is_none());
    }

    #[test]
    fn uninitialized_arena_refuses() {
        let mut arena = BumpArena::default();
        assert!(arena.alloc(8, 8).is_none());
    }
}
