//! Kernel-side service management: the fault supervisor and containers.

pub mod container;
pub mod supervisor;
