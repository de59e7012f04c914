//! Memory management: physical frames, page tables, the kernel heap.

pub mod heap;
pub mod layout;
pub mod paging;
pub mod pmm;

pub use layout::{PAGE_SIZE, KERNEL_VIRT_BASE};
pub use pmm::{MemRegion, PmmStats};
