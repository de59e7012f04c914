//! The minimum in-kernel drivers: console input plumbing and the PS/2
//! keyboard. Everything else is a userspace file server.

pub mod console;
#[cfg(target_arch = "x86_64")]
pub mod keyboard;
