//! Kernel synchronization primitives.

mod ticket;

pub use ticket::{TicketGuard, TicketLock, TicketMutex};
