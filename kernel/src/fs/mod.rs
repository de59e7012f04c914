//! File routing: namespaces and the initrd channel factory.
//!
//! The kernel has no filesystem of its own. Every file operation resolves
//! through the caller's namespace to a channel; the root namespace below
//! is the template kernel-spawned processes start from, and the place
//! the supervisor and initrd install their mounts.

pub mod initrd;
pub mod namespace;

pub use namespace::{MountFlags, Namespace, MAX_MOUNTS};

use crate::sync::TicketMutex;

static ROOT_NS: TicketMutex<Namespace> = TicketMutex::new(Namespace::new());

/// Copy the root namespace into `dest` (kernel-spawned processes).
pub fn clone_root_ns(dest: &mut Namespace) {
    ROOT_NS.lock().clone_into(dest);
}

/// Mount into the root namespace.
pub fn mount_root(path: &str, channel: u32, flags: MountFlags) -> crate::error::KernelResult<()> {
    ROOT_NS.lock().mount(path, channel, flags)
}

/// Run `f` with the root namespace locked.
pub fn with_root_ns<R>(f: impl FnOnce(&mut Namespace) -> R) -> R {
    f(&mut ROOT_NS.lock())
}
