//! Channel table and endpoint state.
//!
//! Channels are synchronous rendezvous points with a server and a client
//! endpoint. All endpoint state lives here under the per-channel ticket
//! lock; the blocking protocol itself (who sleeps, who wakes) is driven
//! by the syscall layer and the scheduler.
//!
//! Lock order: `alloc_lock → channel.lock`. No path holds two channel
//! locks at once; cross-process wakes are performed after the channel
//! lock is dropped.

use crate::{
    error::{IpcError, KernelResult},
    sync::{TicketGuard, TicketLock, TicketMutex},
};

/// System-wide channel table size.
pub const MAX_CHANNELS: usize = 256;

/// One endpoint (server or client side) of a channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Endpoint {
    /// Pid of the endpoint owner; 0 until attached.
    pub owner_pid: u64,
    /// Process slot whose `ipc_msg` holds a message posted at this
    /// endpoint, if any. Ids, not pointers: the slot is re-validated on
    /// every use.
    pub pending_from: Option<usize>,
    /// A sender is parked on this endpoint.
    pub send_waiting: bool,
    /// A receiver is parked on this endpoint.
    pub recv_waiting: bool,
    /// Process slot of the thread blocked on this endpoint.
    pub blocked_slot: Option<usize>,
}

impl Endpoint {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Which side of a channel an fd refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

/// Channel state, guarded by the per-channel lock.
pub struct Channel {
    /// Slot in use.
    pub active: bool,
    /// References held by fd entries and mounts.
    pub refs: u32,
    /// For kernel-backed channels: the immutable bytes served by `read`.
    pub kernel_data: Option<&'static [u8]>,
    pub server: Endpoint,
    pub client: Endpoint,
}

impl Channel {
    const fn new() -> Self {
        Self {
            active: false,
            refs: 0,
            kernel_data: None,
            server: Endpoint {
                owner_pid: 0,
                pending_from: None,
                send_waiting: false,
                recv_waiting: false,
                blocked_slot: None,
            },
            client: Endpoint {
                owner_pid: 0,
                pending_from: None,
                send_waiting: false,
                recv_waiting: false,
                blocked_slot: None,
            },
        }
    }

    pub fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Server => &mut self.server,
            Side::Client => &mut self.client,
        }
    }

    pub fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Server => &self.server,
            Side::Client => &self.client,
        }
    }
}

static CHANNELS: [TicketMutex<Channel>; MAX_CHANNELS] =
    [const { TicketMutex::new(Channel::new()) }; MAX_CHANNELS];

/// Guards the free-slot scan only; individual channels have their own
/// locks.
static ALLOC_LOCK: TicketLock = TicketLock::new();

fn allocate() -> KernelResult<usize> {
    ALLOC_LOCK.lock();
    let mut found = None;
    for (id, slot) in CHANNELS.iter().enumerate() {
        let mut ch = slot.lock();
        if !ch.active {
            ch.active = true;
            ch.refs = 1;
            ch.kernel_data = None;
            ch.server.reset();
            ch.client.reset();
            found = Some(id);
            break;
        }
    }
    ALLOC_LOCK.unlock();
    found.ok_or_else(|| IpcError::NoFreeChannels.into())
}

/// Allocate a fresh channel. The returned id names both endpoints; fds
/// record which side they hold.
pub fn create() -> KernelResult<usize> {
    allocate()
}

/// Allocate a kernel-backed channel serving `data` directly: client reads
/// are satisfied by the kernel with no server thread.
pub fn create_kernel_backed(data: &'static [u8]) -> KernelResult<usize> {
    let id = allocate()?;
    CHANNELS[id].lock().kernel_data = Some(data);
    Ok(id)
}

/// Lock channel `id` and hand out its guard.
pub fn lock(id: usize) -> KernelResult<TicketGuard<'static, Channel>> {
    if id >= MAX_CHANNELS {
        return Err(IpcError::BadChannel { id }.into());
    }
    let ch = CHANNELS[id].lock();
    if !ch.active {
        return Err(IpcError::BadChannel { id }.into());
    }
    Ok(ch)
}

/// Take another reference to `id` (fd duplication, mounts).
pub fn retain(id: usize) {
    if id < MAX_CHANNELS {
        let mut ch = CHANNELS[id].lock();
        if ch.active {
            ch.refs += 1;
        }
    }
}

/// Drop one reference; the slot frees when the count reaches zero.
pub fn release(id: usize) {
    if id >= MAX_CHANNELS {
        return;
    }
    let mut ch = CHANNELS[id].lock();
    if ch.active {
        ch.refs = ch.refs.saturating_sub(1);
        if ch.refs == 0 {
            ch.active = false;
            ch.kernel_data = None;
            ch.server.reset();
            ch.client.reset();
        }
    }
}

/// Kernel-backed payload of `id`, if it is that kind of channel.
pub fn kernel_data(id: usize) -> Option<&'static [u8]> {
    if id >= MAX_CHANNELS {
        return None;
    }
    let ch = CHANNELS[id].lock();
    if ch.active {
        ch.kernel_data
    } else {
        None
    }
}

/// Channels currently allocated; used by container quota checks.
pub fn active_count() -> usize {
    CHANNELS.iter().filter(|c| c.lock().active).count()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // The channel table is global; tests that assert on slot state
    // serialize through the crate test lock.

    #[test]
    fn create_and_release_recycles_slot() {
        let _g = crate::test_support::GLOBAL_TABLES.lock().unwrap();
        let id = create().expect("allocate channel");
        {
            let ch = lock(id).expect("lock fresh channel");
            assert!(ch.active);
            assert_eq!(ch.refs, 1);
            assert!(ch.kernel_data.is_none());
        }
        release(id);
        assert!(lock(id).is_err(), "released slot must not lock");
    }

    #[test]
    fn kernel_backed_channel_serves_bytes() {
        let _g = crate::test_support::GLOBAL_TABLES.lock().unwrap();
        static PAYLOAD: &[u8] = b"XYZ";
        let id = create_kernel_backed(PAYLOAD).expect("allocate");
        assert_eq!(kernel_data(id), Some(PAYLOAD));
        release(id);
        assert_eq!(kernel_data(id), None);
    }

    #[test]
    fn refcount_keeps_slot_alive() {
        let _g = crate::test_support::GLOBAL_TABLES.lock().unwrap();
        let id = create().expect("allocate");
        retain(id);
        release(id);
        assert!(lock(id).is_ok(), "one ref still outstanding");
        release(id);
        assert!(lock(id).is_err());
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        assert!(lock(MAX_CHANNELS).is_err());
        release(MAX_CHANNELS); // no-op, must not panic
    }
}
