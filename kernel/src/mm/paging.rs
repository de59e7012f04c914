//! Four-level page tables and per-process address spaces.
//!
//! Layout contract (both architectures):
//! - user half: top-level entries 0..256, private per process;
//! - kernel half: entries 256..512, shallow-copied from the singleton
//!   kernel top-level so kernel mappings are visible everywhere;
//! - direct map: physical 0..4 GiB at [`KERNEL_VIRT_BASE`] in 2 MiB pages.
//!
//! An address space is identified by the physical address of its root
//! table. Sub-tables are reached exclusively through the direct map.

use crate::{
    error::{KernelResult, MmError},
    mm::{
        layout::{
            page_align_down, phys_ptr, phys_to_virt, DIRECT_MAP_SIZE, KERNEL_VIRT_BASE, PAGE_SIZE,
        },
        pmm,
    },
};

/// Entries per table level.
pub const TABLE_ENTRIES: usize = 512;

/// Top-level index where the kernel half begins.
pub const KERNEL_HALF_START: usize = 256;

bitflags::bitflags! {
    /// Architecture-neutral mapping flags. Encoded into hardware bits by
    /// the per-arch helpers below.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        const WRITABLE   = 1 << 0;
        const USER       = 1 << 1;
        const NO_CACHE   = 1 << 2;
        const NO_EXECUTE = 1 << 3;
    }
}

/// One page table entry, hardware format.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

#[cfg(target_arch = "x86_64")]
mod hw {
    use super::MapFlags;

    pub const PRESENT: u64 = 1;
    pub const WRITE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const NO_CACHE: u64 = 1 << 4;
    pub const HUGE: u64 = 1 << 7;
    pub const NX: u64 = 1 << 63;
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    pub fn encode_leaf(flags: MapFlags) -> u64 {
        let mut bits = PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            bits |= WRITE;
        }
        if flags.contains(MapFlags::USER) {
            bits |= USER;
        }
        if flags.contains(MapFlags::NO_CACHE) {
            bits |= NO_CACHE;
        }
        if flags.contains(MapFlags::NO_EXECUTE) {
            bits |= NX;
        }
        bits
    }

    /// Interior table entries: permissive, leaves decide.
    pub fn encode_table() -> u64 {
        PRESENT | WRITE | USER
    }

    pub fn encode_huge(flags: MapFlags) -> u64 {
        encode_leaf(flags) | HUGE
    }

    pub fn is_leaf(bits: u64, level: usize) -> bool {
        level == 0 || bits & HUGE != 0
    }
}

#[cfg(target_arch = "riscv64")]
mod hw {
    use super::MapFlags;

    pub const PRESENT: u64 = 1; // V
    const READ: u64 = 1 << 1;
    const WRITE: u64 = 1 << 2;
    const EXEC: u64 = 1 << 3;
    const USER: u64 = 1 << 4;
    const ACCESSED: u64 = 1 << 6;
    const DIRTY: u64 = 1 << 7;
    pub const ADDR_MASK: u64 = 0x003F_FFFF_FFFF_FC00;

    pub fn encode_leaf(flags: MapFlags) -> u64 {
        let mut bits = PRESENT | READ | ACCESSED | DIRTY;
        if flags.contains(MapFlags::WRITABLE) {
            bits |= WRITE;
        }
        if flags.contains(MapFlags::USER) {
            bits |= USER;
        }
        if !flags.contains(MapFlags::NO_EXECUTE) {
            bits |= EXEC;
        }
        bits
    }

    /// Pointer to next level: V set, RWX clear.
    pub fn encode_table() -> u64 {
        PRESENT
    }

    pub fn encode_huge(flags: MapFlags) -> u64 {
        encode_leaf(flags)
    }

    pub fn is_leaf(bits: u64, _level: usize) -> bool {
        bits & (READ | WRITE | EXEC) != 0
    }
}

// Non-target hosts (unit tests on e.g. aarch64) get the x86_64 encoding so
// the pure helpers stay testable.
#[cfg(not(any(target_arch = "x86_64", target_arch = "riscv64")))]
mod hw {
    use super::MapFlags;

    pub const PRESENT: u64 = 1;
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    pub fn encode_leaf(flags: MapFlags) -> u64 {
        let mut bits = PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            bits |= 1 << 1;
        }
        if flags.contains(MapFlags::USER) {
            bits |= 1 << 2;
        }
        if flags.contains(MapFlags::NO_CACHE) {
            bits |= 1 << 4;
        }
        if flags.contains(MapFlags::NO_EXECUTE) {
            bits |= 1 << 63;
        }
        bits
    }

    pub fn encode_table() -> u64 {
        PRESENT | (1 << 1) | (1 << 2)
    }

    pub fn encode_huge(flags: MapFlags) -> u64 {
        encode_leaf(flags) | (1 << 7)
    }

    pub fn is_leaf(bits: u64, level: usize) -> bool {
        level == 0 || bits & (1 << 7) != 0
    }
}

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.0 & hw::PRESENT != 0
    }

    #[inline]
    pub fn phys(&self) -> u64 {
        #[cfg(target_arch = "riscv64")]
        {
            (self.0 & hw::ADDR_MASK) << 2
        }
        #[cfg(not(target_arch = "riscv64"))]
        {
            self.0 & hw::ADDR_MASK
        }
    }

    #[inline]
    fn set(&mut self, phys: u64, bits: u64) {
        #[cfg(target_arch = "riscv64")]
        {
            self.0 = ((phys >> 2) & hw::ADDR_MASK) | bits;
        }
        #[cfg(not(target_arch = "riscv64"))]
        {
            self.0 = (phys & hw::ADDR_MASK) | bits;
        }
    }

    #[inline]
    fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 512-entry table. Always page-aligned, always reached via the direct
/// map.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTable {
    fn zero(&mut self) {
        for e in self.entries.iter_mut() {
            e.clear();
        }
    }
}

/// Top-level index for `vaddr` at `level` (3 = root).
#[inline]
pub const fn table_index(vaddr: u64, level: usize) -> usize {
    ((vaddr >> (12 + 9 * level)) & 0x1FF) as usize
}

/// Borrow a table from its physical address.
///
/// # Safety
///
/// `phys` must be a live page table frame owned by the address space the
/// caller is operating on, and the caller must hold whatever exclusion the
/// space requires (spaces are mutated only by their owning process's core,
/// or during creation before the process is visible).
unsafe fn table_mut<'a>(phys: u64) -> &'a mut PageTable {
    // SAFETY: per the function contract, plus the direct map covering all
    // table frames (they come from the PMM, below 4 GiB on supported
    // configurations).
    unsafe { &mut *phys_ptr::<PageTable>(phys) }
}

fn alloc_table() -> KernelResult<u64> {
    let phys = pmm::alloc_page()?;
    // SAFETY: freshly allocated frame, exclusively ours until linked into a
    // table below.
    unsafe { table_mut(phys).zero() };
    Ok(phys)
}

/// Singleton kernel top-level, shared (entries 256..512) by every space.
static KERNEL_ROOT: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Build the kernel top-level. The boot stage's kernel-half entries
/// (kernel text and whatever else the loader mapped high) are inherited
/// wholesale, then the direct map of physical 0..4 GiB is installed in
/// 2 MiB pages at [`KERNEL_VIRT_BASE`]. Called once during bootstrap,
/// before any process exists, while the boot tables are still active.
pub fn init_kernel_space() -> KernelResult<u64> {
    use core::sync::atomic::Ordering;

    let root = alloc_table()?;
    let flags = MapFlags::WRITABLE;

    let boot_root = crate::arch::current_root();
    // SAFETY: `root` is fresh; the boot root's kernel half is read-only
    // here and stays live until the switch below completes.
    unsafe {
        let dst = table_mut(root);
        let src = table_mut(boot_root);
        dst.entries[KERNEL_HALF_START..].copy_from_slice(&src.entries[KERNEL_HALF_START..]);
    }

    // One L3 table spans 512 GiB; its first four entries cover the 4 GiB
    // direct map, each through an L2 table of 2 MiB leaves.
    let l3 = alloc_table()?;
    // SAFETY: `root` and `l3` were just allocated and are exclusively ours.
    unsafe {
        table_mut(root).entries[table_index(KERNEL_VIRT_BASE, 3)].set(l3, hw::encode_table());
    }
    let gib = 1u64 << 30;
    let mut phys = 0u64;
    for l3_idx in 0..(DIRECT_MAP_SIZE / gib) as usize {
        let l2 = alloc_table()?;
        // SAFETY: as above; `l2` is fresh and `l3` is still private.
        unsafe {
            table_mut(l3).entries[l3_idx].set(l2, hw::encode_table());
            let l2_table = table_mut(l2);
            for entry in l2_table.entries.iter_mut() {
                entry.set(phys, hw::encode_huge(flags));
                phys += 2 << 20;
            }
        }
    }

    KERNEL_ROOT.store(root, Ordering::Release);
    log::info!(target: "mm", "kernel space at {:#x}, direct map {} GiB", root, DIRECT_MAP_SIZE >> 30);
    Ok(root)
}

/// Physical address of the kernel top-level.
pub fn kernel_root() -> u64 {
    KERNEL_ROOT.load(core::sync::atomic::Ordering::Acquire)
}

/// Create a fresh address space: private empty user half, shared kernel
/// half.
pub fn create_address_space() -> KernelResult<u64> {
    let root = alloc_table()?;
    let kroot = kernel_root();
    // SAFETY: `root` is fresh; the kernel root is only read. Kernel-half
    // entries are shallow-copied so later kernel mappings (which only ever
    // add to the shared sub-tables) appear in every space.
    unsafe {
        let dst = table_mut(root);
        let src = table_mut(kroot);
        dst.entries[KERNEL_HALF_START..].copy_from_slice(&src.entries[KERNEL_HALF_START..]);
    }
    Ok(root)
}

/// Install a 4 KiB mapping.
pub fn map_page(root: u64, vaddr: u64, phys: u64, flags: MapFlags) -> KernelResult<()> {
    let vaddr = page_align_down(vaddr);
    let mut table = root;
    for level in (1..=3).rev() {
        let idx = table_index(vaddr, level);
        // SAFETY: `table` is a table frame of this space; exclusion per
        // `table_mut` contract.
        let entry = unsafe { &mut table_mut(table).entries[idx] };
        if !entry.is_present() {
            let next = alloc_table()?;
            entry.set(next, hw::encode_table());
        }
        table = entry.phys();
    }
    // SAFETY: `table` is now the leaf-level table of this space.
    let leaf = unsafe { &mut table_mut(table).entries[table_index(vaddr, 0)] };
    if leaf.is_present() {
        return Err(MmError::AlreadyMapped { vaddr }.into());
    }
    leaf.set(phys, hw::encode_leaf(flags));
    Ok(())
}

/// Remove a 4 KiB mapping, returning the frame it pointed at.
pub fn unmap_page(root: u64, vaddr: u64) -> KernelResult<u64> {
    let vaddr = page_align_down(vaddr);
    let mut table = root;
    for level in (1..=3).rev() {
        let idx = table_index(vaddr, level);
        // SAFETY: table frame of this space, see `table_mut`.
        let entry = unsafe { &table_mut(table).entries[idx] };
        if !entry.is_present() {
            return Err(MmError::NotMapped { vaddr }.into());
        }
        table = entry.phys();
    }
    // SAFETY: leaf table of this space.
    let leaf = unsafe { &mut table_mut(table).entries[table_index(vaddr, 0)] };
    if !leaf.is_present() {
        return Err(MmError::NotMapped { vaddr }.into());
    }
    let phys = leaf.phys();
    leaf.clear();
    Ok(phys)
}

/// Translate a virtual address in `root`, honoring huge leaf entries.
pub fn translate(root: u64, vaddr: u64) -> Option<u64> {
    let mut table = root;
    for level in (0..=3).rev() {
        let idx = table_index(vaddr, level);
        // SAFETY: table frames of a live space; read-only walk.
        let entry = unsafe { &table_mut(table).entries[idx] };
        if !entry.is_present() {
            return None;
        }
        if hw::is_leaf(entry.0, level) {
            let page_bits = 12 + 9 * level;
            let offset = vaddr & ((1u64 << page_bits) - 1);
            return Some(entry.phys() + offset);
        }
        table = entry.phys();
    }
    None
}

/// Free every user-half leaf frame and intermediate table of `root`,
/// then the root itself. Kernel-half sub-tables are shared and survive.
///
/// The caller must have already switched the current core off this space
/// and shot down every core in the owner's `cores_ran_on`.
pub fn free_address_space(root: u64) {
    fn free_level(table: u64, level: usize) {
        for idx in 0..TABLE_ENTRIES {
            // SAFETY: `table` is a user-half table frame of a space being
            // torn down; no core can touch it any more (see caller
            // contract above).
            let entry = unsafe { &table_mut(table).entries[idx] };
            if !entry.is_present() {
                continue;
            }
            let phys = entry.phys();
            if hw::is_leaf(entry.0, level) {
                pmm::free_page(phys);
            } else {
                free_level(phys, level - 1);
                pmm::free_page(phys);
            }
        }
    }

    for idx in 0..KERNEL_HALF_START {
        // SAFETY: as in `free_level`; the root is ours to tear down.
        let entry = unsafe { &table_mut(root).entries[idx] };
        if entry.is_present() {
            free_level(entry.phys(), 2);
            pmm::free_page(entry.phys());
        }
    }
    pmm::free_page(root);
}

/// Copy bytes into `root`'s user half, walking its tables page by page.
/// Works regardless of which space is active on the current core.
pub fn copy_to_space(root: u64, vaddr: u64, data: &[u8]) -> KernelResult<()> {
    let mut copied = 0usize;
    while copied < data.len() {
        let va = vaddr + copied as u64;
        let phys = translate(root, va).ok_or(MmError::NotMapped { vaddr: va })?;
        let in_page = PAGE_SIZE - (va as usize & (PAGE_SIZE - 1));
        let chunk = in_page.min(data.len() - copied);
        // SAFETY: `phys` was just translated from a live mapping of this
        // space; the direct map makes it addressable; `chunk` stays inside
        // the page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data[copied..].as_ptr(),
                phys_ptr::<u8>(phys),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy bytes out of `root`'s user half.
pub fn copy_from_space(root: u64, vaddr: u64, buf: &mut [u8]) -> KernelResult<()> {
    let mut copied = 0usize;
    while copied < buf.len() {
        let va = vaddr + copied as u64;
        let phys = translate(root, va).ok_or(MmError::NotMapped { vaddr: va })?;
        let in_page = PAGE_SIZE - (va as usize & (PAGE_SIZE - 1));
        let chunk = in_page.min(buf.len() - copied);
        // SAFETY: as in `copy_to_space`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_ptr::<u8>(phys),
                buf[copied..].as_mut_ptr(),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Zero a physical frame through the direct map.
pub fn zero_frame(phys: u64) {
    // SAFETY: callers pass freshly allocated frames they exclusively own.
    unsafe { core::ptr::write_bytes(phys_ptr::<u8>(phys), 0, PAGE_SIZE) };
}

/// Make `root` the active space on this core.
pub fn switch_address_space(root: u64) {
    crate::arch::load_root(root);
}

/// Switch the current core onto the kernel top-level. Required before a
/// space is freed.
pub fn switch_to_kernel() {
    crate::arch::load_root(kernel_root());
}

/// The direct map means `phys_to_virt` is total over mapped RAM; re-export
/// for callers that think in pointers.
pub fn direct_map_ptr<T>(phys: u64) -> *mut T {
    phys_to_virt(phys) as *mut T
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn index_split_covers_48_bits() {
        let vaddr = 0x0000_7FFF_FFF0_1234u64;
        assert_eq!(table_index(vaddr, 3), 255);
        // Reassemble the address from its indices.
        let rebuilt = ((table_index(vaddr, 3) as u64) << 39)
            | ((table_index(vaddr, 2) as u64) << 30)
            | ((table_index(vaddr, 1) as u64) << 21)
            | ((table_index(vaddr, 0) as u64) << 12)
            | (vaddr & 0xFFF);
        assert_eq!(rebuilt, vaddr);
    }

    #[test]
    fn kernel_half_starts_at_256() {
        assert_eq!(table_index(KERNEL_VIRT_BASE, 3), KERNEL_HALF_START);
    }

    #[test]
    fn leaf_encoding_reflects_flags() {
        let bits = hw::encode_leaf(MapFlags::WRITABLE | MapFlags::USER);
        assert_ne!(bits & hw::PRESENT, 0);
        let ro = hw::encode_leaf(MapFlags::empty());
        assert_ne!(bits, ro);
    }

    #[test]
    fn entry_round_trips_phys() {
        let mut e = PageTableEntry::empty();
        e.set(0x1234_5000, hw::encode_leaf(MapFlags::WRITABLE));
        assert!(e.is_present());
        assert_eq!(e.phys(), 0x1234_5000);
    }
}
