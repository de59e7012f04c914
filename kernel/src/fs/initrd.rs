//! Initrd image parsing and mounting.
//!
//! Wire format, little-endian throughout:
//!
//! ```text
//! magic   "FXINITRD"            8 bytes
//! count   u32                   number of entries
//! entries count × 72 bytes      name[64] NUL-padded, offset u32, size u32
//! data                          at offsets relative to image start
//! ```
//!
//! Each entry becomes a kernel-backed channel mounted at `/boot/<name>`
//! in the root namespace: reads are served straight from the image bytes
//! with no server thread.

use crate::{
    error::{KernelError, KernelResult},
    fs::{self, MountFlags},
    ipc::channel,
};

const MAGIC: &[u8; 8] = b"FXINITRD";
const HEADER_SIZE: usize = 12;
const ENTRY_SIZE: usize = 72;
const NAME_MAX: usize = 64;

/// One parsed entry.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(
        bytes.get(at..at + 4)?.try_into().ok()?,
    ))
}

/// Parse the image header; returns the entry count.
fn entry_count(image: &[u8]) -> KernelResult<usize> {
    if image.len() < HEADER_SIZE || &image[..8] != MAGIC {
        return Err(KernelError::InvalidArgument);
    }
    let count = read_u32(image, 8).ok_or(KernelError::InvalidArgument)? as usize;
    if HEADER_SIZE + count * ENTRY_SIZE > image.len() {
        return Err(KernelError::InvalidArgument);
    }
    Ok(count)
}

/// Parse entry `idx`. Entries with malformed names or out-of-bounds data
/// yield `None`.
pub fn entry(image: &[u8], idx: usize) -> Option<Entry<'_>> {
    let base = HEADER_SIZE + idx * ENTRY_SIZE;
    let record = image.get(base..base + ENTRY_SIZE)?;
    let name_len = record[..NAME_MAX]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(NAME_MAX);
    let name = core::str::from_utf8(&record[..name_len]).ok()?;
    if name.is_empty() {
        return None;
    }
    let offset = read_u32(record, NAME_MAX)? as usize;
    let size = read_u32(record, NAME_MAX + 4)? as usize;
    let data = image.get(offset..offset.checked_add(size)?)?;
    Some(Entry { name, data })
}

/// Iterate valid entries of `image`.
pub fn entries(image: &[u8]) -> impl Iterator<Item = Entry<'_>> {
    let count = entry_count(image).unwrap_or(0);
    (0..count).filter_map(move |idx| entry(image, idx))
}

/// Mount every initrd file at `/boot/<name>` as a kernel-backed channel.
/// Returns how many files were mounted; a malformed image mounts none.
pub fn mount_all(image: &'static [u8]) -> usize {
    let count = match entry_count(image) {
        Ok(c) => c,
        Err(_) => {
            log::warn!(target: "initrd", "malformed initrd image ({} bytes), ignoring", image.len());
            return 0;
        }
    };

    let mut mounted = 0;
    for idx in 0..count {
        let Some(entry) = entry(image, idx) else {
            log::warn!(target: "initrd", "skipping malformed entry {}", idx);
            continue;
        };
        let mut path = [0u8; NAME_MAX + 8];
        let prefix = b"/boot/";
        path[..prefix.len()].copy_from_slice(prefix);
        path[prefix.len()..prefix.len() + entry.name.len()]
            .copy_from_slice(entry.name.as_bytes());
        // SAFETY: built from two str slices above.
        let path = unsafe {
            core::str::from_utf8_unchecked(&path[..prefix.len() + entry.name.len()])
        };

        let chan = match channel::create_kernel_backed(entry.data) {
            Ok(c) => c,
            Err(e) => {
                log::warn!(target: "initrd", "no channel for {}: {}", entry.name, e);
                continue;
            }
        };
        match fs::mount_root(path, chan as u32, MountFlags::REPLACE) {
            Ok(()) => {
                // The namespace took its own reference.
                channel::release(chan);
                mounted += 1;
                log::debug!(target: "initrd", "{} ({} bytes)", path, entry.data.len());
            }
            Err(e) => {
                channel::release(chan);
                log::warn!(target: "initrd", "mount {} failed: {}", path, e);
            }
        }
    }
    log::info!(target: "initrd", "mounted {} of {} entries", mounted, count);
    mounted
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn build_image(files: &[(&str, &[u8])]) -> std::vec::Vec<u8> {
        let mut image = std::vec::Vec::new();
        image.extend_from_slice(MAGIC);
        image.extend_from_slice(&(files.len() as u32).to_le_bytes());
        let data_start = HEADER_SIZE + files.len() * ENTRY_SIZE;
        let mut offset = data_start;
        for (name, data) in files {
            let mut record = [0u8; ENTRY_SIZE];
            record[..name.len()].copy_from_slice(name.as_bytes());
            record[NAME_MAX..NAME_MAX + 4].copy_from_slice(&(offset as u32).to_le_bytes());
            record[NAME_MAX + 4..NAME_MAX + 8]
                .copy_from_slice(&(data.len() as u32).to_le_bytes());
            image.extend_from_slice(&record);
            offset += data.len();
        }
        for (_, data) in files {
            image.extend_from_slice(data);
        }
        image
    }

    #[test]
    fn parses_entries_in_order() {
        let image = build_image(&[("init", b"XYZ"), ("shell", b"ELF!")]);
        let parsed: std::vec::Vec<_> = entries(&image).collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "init");
        assert_eq!(parsed[0].data, b"XYZ");
        assert_eq!(parsed[1].name, "shell");
        assert_eq!(parsed[1].data, b"ELF!");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut image = build_image(&[("init", b"XYZ")]);
        image[0] = b'Z';
        assert!(entry_count(&image).is_err());
        assert_eq!(entries(&image).count(), 0);
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(entry_count(b"FXINIT").is_err());
        let mut image = build_image(&[("init", b"XYZ")]);
        image.truncate(HEADER_SIZE + 10);
        assert!(entry_count(&image).is_err());
    }

    #[test]
    fn out_of_bounds_data_is_skipped() {
        let mut image = build_image(&[("init", b"XYZ")]);
        // Point the entry past the end of the image.
        let off_at = HEADER_SIZE + NAME_MAX;
        image[off_at..off_at + 4].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert_eq!(entries(&image).count(), 0);
    }

    #[test]
    fn empty_name_is_skipped() {
        let image = build_image(&[("", b"XYZ")]);
        assert_eq!(entries(&image).count(), 0);
    }
}
