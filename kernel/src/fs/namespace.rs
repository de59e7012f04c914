//! Per-process namespaces.
//!
//! A namespace is a fixed-capacity mount table routing path prefixes to
//! channels. Resolution picks the mount with the longest prefix that ends
//! on a path boundary; ties go to insertion order. Namespaces own one
//! channel reference per mount.

use crate::{
    error::{FsError, KernelResult},
    ipc::channel,
};

/// Mounts per namespace.
pub const MAX_MOUNTS: usize = 32;

/// Longest mount path, NUL exclusive.
pub const MOUNT_PATH_MAX: usize = 64;

bitflags::bitflags! {
    /// Mount behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u32 {
        /// Remove an existing mount at the exact path first.
        const REPLACE = 1 << 0;
        /// Insert ahead of existing mounts (wins prefix-length ties).
        const BEFORE = 1 << 1;
        /// Append after existing mounts (the default).
        const AFTER = 1 << 2;
    }
}

/// One mount entry.
#[derive(Clone, Copy)]
pub struct Mount {
    path: [u8; MOUNT_PATH_MAX],
    path_len: u8,
    pub channel: u32,
    pub flags: MountFlags,
}

impl Mount {
    const fn empty() -> Self {
        Self {
            path: [0; MOUNT_PATH_MAX],
            path_len: 0,
            channel: 0,
            flags: MountFlags::empty(),
        }
    }

    pub fn path(&self) -> &str {
        // SAFETY: `path` is only ever filled from `&str` input in
        // `Namespace::mount`, so the stored bytes are valid UTF-8.
        unsafe { core::str::from_utf8_unchecked(&self.path[..self.path_len as usize]) }
    }
}

/// Strip trailing slashes; `/` itself normalizes to the empty prefix.
fn normalize(path: &str) -> &str {
    path.trim_end_matches('/')
}

/// Does `prefix` match `path` up to a path boundary?
fn boundary_prefix(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/'
}

/// A fixed-capacity mount table.
pub struct Namespace {
    mounts: [Mount; MAX_MOUNTS],
    count: usize,
}

impl Namespace {
    pub const fn new() -> Self {
        Self {
            mounts: [Mount::empty(); MAX_MOUNTS],
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts[..self.count]
    }

    /// Install a mount of `channel` at `path`. Takes one channel reference.
    pub fn mount(&mut self, path: &str, channel_id: u32, flags: MountFlags) -> KernelResult<()> {
        let path = normalize(path);
        if path.len() > MOUNT_PATH_MAX {
            return Err(FsError::MountTableFull.into());
        }
        if flags.contains(MountFlags::REPLACE) {
            let _ = self.unmount_normalized(path);
        }
        if self.count == MAX_MOUNTS {
            return Err(FsError::MountTableFull.into());
        }

        let mut entry = Mount::empty();
        entry.path[..path.len()].copy_from_slice(path.as_bytes());
        entry.path_len = path.len() as u8;
        entry.channel = channel_id;
        entry.flags = flags;

        if flags.contains(MountFlags::BEFORE) {
            self.mounts.copy_within(0..self.count, 1);
            self.mounts[0] = entry;
        } else {
            self.mounts[self.count] = entry;
        }
        self.count += 1;
        channel::retain(channel_id as usize);
        Ok(())
    }

    fn unmount_normalized(&mut self, path: &str) -> KernelResult<()> {
        let idx = self
            .mounts[..self.count]
            .iter()
            .position(|m| m.path() == path)
            .ok_or(FsError::NotMounted)?;
        let channel_id = self.mounts[idx].channel;
        self.mounts.copy_within(idx + 1..self.count, idx);
        self.count -= 1;
        channel::release(channel_id as usize);
        Ok(())
    }

    /// Remove one mount whose path exactly matches.
    pub fn unmount(&mut self, path: &str) -> KernelResult<()> {
        self.unmount_normalized(normalize(path))
    }

    /// Resolve `path` to `(channel, suffix)` by longest boundary prefix.
    /// The suffix has its leading slash stripped.
    pub fn resolve<'p>(&self, path: &'p str) -> Option<(u32, &'p str)> {
        let mut best: Option<(usize, usize)> = None; // (mount idx, prefix len)
        for (idx, mount) in self.mounts[..self.count].iter().enumerate() {
            let prefix = mount.path();
            if boundary_prefix(prefix, path) {
                // Strictly longer wins; equal length keeps the earlier one.
                if best.is_none_or(|(_, len)| prefix.len() > len) {
                    best = Some((idx, prefix.len()));
                }
            }
        }
        let (idx, len) = best?;
        let suffix = path[len..].trim_start_matches('/');
        Some((self.mounts[idx].channel, suffix))
    }

    /// Copy every mount into `dest`, taking fresh channel references.
    /// Used by thread and child creation.
    pub fn clone_into(&self, dest: &mut Namespace) {
        dest.clear();
        for mount in &self.mounts[..self.count] {
            dest.mounts[dest.count] = *mount;
            dest.count += 1;
            channel::retain(mount.channel as usize);
        }
    }

    /// Drop every mount and its channel reference.
    pub fn clear(&mut self) {
        for mount in &self.mounts[..self.count] {
            channel::release(mount.channel as usize);
        }
        self.count = 0;
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // Channel ids here are from the top of the id range, where the
    // allocator (which hands out the lowest free slot) never lands during
    // tests; retain/release on inactive slots are no-ops.

    #[test]
    fn longest_boundary_prefix_wins() {
        let mut ns = Namespace::new();
        ns.mount("/", 201, MountFlags::empty()).expect("mount root");
        ns.mount("/dev/", 202, MountFlags::empty()).expect("mount dev");

        assert_eq!(ns.resolve("/dev/tty"), Some((202, "tty")));
        assert_eq!(ns.resolve("/etc/passwd"), Some((201, "etc/passwd")));
        assert_eq!(ns.resolve("/dev"), Some((202, "")));
        // Not a path boundary: /devices does not match /dev.
        assert_eq!(ns.resolve("/devices/x"), Some((201, "devices/x")));
    }

    #[test]
    fn mount_resolve_round_trip() {
        let mut ns = Namespace::new();
        ns.mount("/boot/init", 207, MountFlags::empty())
            .expect("mount");
        assert_eq!(ns.resolve("/boot/init"), Some((207, "")));
    }

    #[test]
    fn replace_is_idempotent() {
        let mut ns = Namespace::new();
        ns.mount("/srv", 203, MountFlags::REPLACE).expect("first");
        ns.mount("/srv", 204, MountFlags::REPLACE).expect("second");
        assert_eq!(ns.len(), 1);
        assert_eq!(ns.resolve("/srv/x"), Some((204, "x")));
    }

    #[test]
    fn ties_go_to_insertion_order_unless_before() {
        let mut ns = Namespace::new();
        ns.mount("/data", 211, MountFlags::empty()).expect("first");
        ns.mount("/data", 212, MountFlags::empty()).expect("second");
        assert_eq!(ns.resolve("/data/f").map(|r| r.0), Some(211));

        ns.mount("/data", 213, MountFlags::BEFORE).expect("before");
        assert_eq!(ns.resolve("/data/f").map(|r| r.0), Some(213));
    }

    #[test]
    fn unmount_removes_one_exact_match() {
        let mut ns = Namespace::new();
        ns.mount("/a", 221, MountFlags::empty()).expect("mount");
        ns.mount("/a", 222, MountFlags::empty()).expect("mount");
        ns.unmount("/a").expect("unmount");
        assert_eq!(ns.len(), 1);
        assert!(ns.unmount("/missing").is_err());
    }

    #[test]
    fn clone_copies_all_mounts() {
        let mut ns = Namespace::new();
        ns.mount("/", 231, MountFlags::empty()).expect("mount");
        ns.mount("/dev", 232, MountFlags::empty()).expect("mount");
        let mut child = Namespace::new();
        ns.clone_into(&mut child);
        assert_eq!(child.len(), 2);
        assert_eq!(child.resolve("/dev/kbd"), Some((232, "kbd")));
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let mut ns = Namespace::new();
        ns.mount("/dev/", 242, MountFlags::empty()).expect("mount");
        assert_eq!(ns.mounts()[0].path(), "/dev");
        assert_eq!(ns.resolve("/dev/tty"), Some((242, "tty")));
    }
}
