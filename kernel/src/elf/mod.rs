//! ELF64 loading.
//!
//! Validates the header, then maps each `PT_LOAD` segment page by page:
//! fresh frame, zero, copy the overlapping file bytes, install in the
//! target address space. The highest mapped address, page-aligned up,
//! becomes the program break. Load failure leaks whatever was already
//! installed; callers treat it as fatal for the target process.

use crate::{
    error::{KernelResult, MmError},
    mm::{
        layout::{page_align_down, page_align_up, phys_ptr, user_range_ok, PAGE_SIZE},
        paging::{self, MapFlags},
        pmm,
    },
};

const MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const TYPE_EXEC: u16 = 2;
const TYPE_DYN: u16 = 3;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;

#[cfg(target_arch = "x86_64")]
const EXPECTED_MACHINE: u16 = 62; // EM_X86_64
#[cfg(target_arch = "riscv64")]
const EXPECTED_MACHINE: u16 = 243; // EM_RISCV
#[cfg(not(any(target_arch = "x86_64", target_arch = "riscv64")))]
const EXPECTED_MACHINE: u16 = 62;

fn u16_at(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(at..at + 2)?.try_into().ok()?))
}

fn u32_at(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn u64_at(b: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(b.get(at..at + 8)?.try_into().ok()?))
}

/// Validated image header facts.
#[derive(Debug, Clone, Copy)]
pub struct ElfInfo {
    pub entry: u64,
    phoff: usize,
    phentsize: usize,
    phnum: usize,
}

/// One program header, the fields the loader cares about.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u64,
    pub offset: usize,
    pub filesz: usize,
    pub memsz: usize,
    pub writable: bool,
    pub executable: bool,
}

/// Validate the ELF header: magic, 64-bit class, executable type, and
/// machine match.
pub fn parse(image: &[u8]) -> KernelResult<ElfInfo> {
    let bad = || MmError::BadElf.into();
    if image.len() < 64 || image[..4] != MAGIC || image[4] != CLASS_64 {
        return Err(bad());
    }
    let e_type = u16_at(image, 16).ok_or_else(bad)?;
    if e_type != TYPE_EXEC && e_type != TYPE_DYN {
        return Err(bad());
    }
    if u16_at(image, 18).ok_or_else(bad)? != EXPECTED_MACHINE {
        return Err(bad());
    }
    let info = ElfInfo {
        entry: u64_at(image, 24).ok_or_else(bad)?,
        phoff: u64_at(image, 32).ok_or_else(bad)? as usize,
        phentsize: u16_at(image, 54).ok_or_else(bad)? as usize,
        phnum: u16_at(image, 56).ok_or_else(bad)? as usize,
    };
    if info.phentsize < 56
        || info
            .phoff
            .checked_add(info.phnum * info.phentsize)
            .is_none_or(|end| end > image.len())
    {
        return Err(bad());
    }
    Ok(info)
}

/// Iterate the `PT_LOAD` segments of a validated image.
pub fn load_segments<'a>(
    image: &'a [u8],
    info: &ElfInfo,
) -> impl Iterator<Item = Segment> + 'a {
    let phoff = info.phoff;
    let phentsize = info.phentsize;
    (0..info.phnum).filter_map(move |i| {
        let at = phoff + i * phentsize;
        if u32_at(image, at)? != PT_LOAD {
            return None;
        }
        let flags = u32_at(image, at + 4)?;
        Some(Segment {
            offset: u64_at(image, at + 8)? as usize,
            vaddr: u64_at(image, at + 16)?,
            filesz: u64_at(image, at + 32)? as usize,
            memsz: u64_at(image, at + 40)? as usize,
            writable: flags & PF_W != 0,
            executable: flags & PF_X != 0,
        })
    })
}

/// Result of loading an image into an address space.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub entry: u64,
    /// Initial program break: highest loaded address, page-aligned up.
    pub brk: u64,
    /// User pages mapped (quota accounting).
    pub pages_mapped: usize,
}

/// Load `image` into `space_root`.
pub fn load(space_root: u64, image: &[u8]) -> KernelResult<LoadedImage> {
    let info = parse(image)?;
    let mut highest = 0u64;
    let mut pages = 0usize;

    for seg in load_segments(image, &info) {
        if seg.memsz == 0 {
            continue;
        }
        if !user_range_ok(seg.vaddr, seg.memsz) || seg.offset + seg.filesz > image.len() {
            return Err(MmError::BadElf.into());
        }
        let start = page_align_down(seg.vaddr);
        let end = page_align_up(seg.vaddr + seg.memsz as u64);
        let mut flags = MapFlags::USER;
        if seg.writable {
            flags |= MapFlags::WRITABLE;
        }
        if !seg.executable {
            flags |= MapFlags::NO_EXECUTE;
        }

        let mut page = start;
        while page < end {
            let frame = pmm::alloc_page()?;
            paging::zero_frame(frame);

            // Overlap of this page with the segment's file bytes.
            let file_start = seg.vaddr.max(page);
            let file_end = (seg.vaddr + seg.filesz as u64).min(page + PAGE_SIZE as u64);
            if file_start < file_end {
                let src = seg.offset + (file_start - seg.vaddr) as usize;
                let dst_off = (file_start - page) as usize;
                let n = (file_end - file_start) as usize;
                // SAFETY: `frame` is a fresh frame we exclusively own,
                // reached through the direct map; `dst_off + n` stays
                // within the page, and `src + n` was bounds-checked
                // against the image above.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        image[src..].as_ptr(),
                        phys_ptr::<u8>(frame).add(dst_off),
                        n,
                    );
                }
            }

            paging::map_page(space_root, page, frame, flags)?;
            pages += 1;
            page += PAGE_SIZE as u64;
        }
        highest = highest.max(end);
    }

    if pages == 0 {
        return Err(MmError::BadElf.into());
    }
    Ok(LoadedImage {
        entry: info.entry,
        brk: highest,
        pages_mapped: pages,
    })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn minimal_elf(machine: u16, phnum: u16) -> std::vec::Vec<u8> {
        let mut image = std::vec![0u8; 64 + phnum as usize * 56];
        image[..4].copy_from_slice(&MAGIC);
        image[4] = CLASS_64;
        image[16..18].copy_from_slice(&TYPE_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&machine.to_le_bytes());
        image[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // entry
        image[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        image[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        image[56..58].copy_from_slice(&phnum.to_le_bytes());
        image
    }

    #[test]
    fn accepts_minimal_header() {
        let image = minimal_elf(EXPECTED_MACHINE, 0);
        let info = parse(&image).expect("valid header");
        assert_eq!(info.entry, 0x40_1000);
    }

    #[test]
    fn rejects_bad_magic_class_machine() {
        let mut image = minimal_elf(EXPECTED_MACHINE, 0);
        image[0] = 0;
        assert!(parse(&image).is_err());

        let mut image = minimal_elf(EXPECTED_MACHINE, 0);
        image[4] = 1; // 32-bit
        assert!(parse(&image).is_err());

        let image = minimal_elf(EXPECTED_MACHINE + 1, 0);
        assert!(parse(&image).is_err());

        assert!(parse(b"short").is_err());
    }

    #[test]
    fn rejects_truncated_phdr_table() {
        let mut image = minimal_elf(EXPECTED_MACHINE, 4);
        image.truncate(64 + 56); // claims 4 phdrs, has 1
        assert!(parse(&image).is_err());
    }

    #[test]
    fn finds_pt_load_segments() {
        let mut image = minimal_elf(EXPECTED_MACHINE, 2);
        // phdr 0: PT_LOAD at vaddr 0x400000, filesz 16, memsz 32, RW
        let at = 64;
        image[at..at + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[at + 4..at + 8].copy_from_slice(&(PF_W | 4u32).to_le_bytes());
        image[at + 16..at + 24].copy_from_slice(&0x40_0000u64.to_le_bytes());
        image[at + 32..at + 40].copy_from_slice(&16u64.to_le_bytes());
        image[at + 40..at + 48].copy_from_slice(&32u64.to_le_bytes());
        // phdr 1: PT_NOTE, ignored
        let at2 = 64 + 56;
        image[at2..at2 + 4].copy_from_slice(&4u32.to_le_bytes());

        let info = parse(&image).expect("valid");
        let segs: std::vec::Vec<_> = load_segments(&image, &info).collect();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].vaddr, 0x40_0000);
        assert!(segs[0].writable);
        assert!(!segs[0].executable);
        assert_eq!(segs[0].memsz, 32);
    }
}
