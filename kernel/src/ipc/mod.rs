//! Synchronous channel IPC.
//!
//! Rendezvous model: copy on delivery, one thread per endpoint. A client
//! request parks the client on the channel; if the server is already in
//! `ipc_recv` the message is handed off immediately, otherwise it waits
//! on the client endpoint until the server asks. Replies flow back
//! through `ipc_reply`, which translates them into the client's syscall
//! return (see the syscall layer) -- with actual user-memory delivery
//! deferred to the scheduler's post-switch hook, because at reply time
//! the *server's* address space is active and the client's user pointers
//! are meaningless.

pub mod channel;
pub mod message;
pub mod pipe;

pub use channel::{Channel, Side, MAX_CHANNELS};
pub use message::{Message, MsgTag, UserMessage, MSG_DATA_MAX};

use crate::{
    error::{IpcError, KernelResult},
    process::table,
};

/// Park the sender's request (already staged in its `ipc_msg`) on the
/// client endpoint of `chan`. If a receiver is blocked in `ipc_recv`,
/// the message is handed to it now: its slot is returned so the caller
/// can wake it once the channel lock is released.
///
/// The caller subsequently blocks; the channel remembers it via
/// `blocked_slot` for reply routing.
pub fn post_request(chan: usize, sender_slot: usize) -> KernelResult<Option<usize>> {
    let sender_pid = table::slot_pid(sender_slot);
    let mut ch = channel::lock(chan)?;

    ch.client.owner_pid = sender_pid;
    ch.client.pending_from = Some(sender_slot);
    ch.client.send_waiting = true;
    ch.client.blocked_slot = Some(sender_slot);

    if ch.server.recv_waiting {
        let receiver = ch.server.blocked_slot;
        ch.server.recv_waiting = false;
        ch.server.blocked_slot = None;
        // Hand off now so the server's next recv does not re-deliver.
        ch.client.pending_from = None;
        if let Some(rslot) = receiver {
            // Re-validate pid → slot before touching the receiver; a dead
            // server leaves a stale slot behind.
            if table::slot_pid(rslot) != ch.server.owner_pid {
                ch.client.pending_from = Some(sender_slot);
                return Ok(None);
            }
            // SAFETY: sender runs on this core (its syscall), receiver is
            // blocked and named by the locked channel -- both mutation
            // rights hold; the slots are distinct (a thread cannot be
            // blocked in recv while issuing a send).
            unsafe {
                let msg = table::slot_mut(sender_slot).ipc_msg;
                table::slot_mut(rslot).ipc_pending_msg = Some(msg);
            }
            return Ok(receiver);
        }
    }
    Ok(None)
}

/// Server-side receive attempt. Returns the pending request if one is
/// parked on the client endpoint; otherwise registers the server as the
/// blocked receiver and returns `None` (the caller blocks).
pub fn try_recv(chan: usize, server_slot: usize) -> KernelResult<Option<Message>> {
    let server_pid = table::slot_pid(server_slot);
    let mut ch = channel::lock(chan)?;
    ch.server.owner_pid = server_pid;

    if let Some(sender_slot) = ch.client.pending_from.take() {
        // Re-validate pid → slot: the sender may have been killed and
        // the slot recycled while the message sat parked.
        if table::slot_pid(sender_slot) == ch.client.owner_pid {
            // SAFETY: sender is blocked and named by the locked channel.
            let msg = unsafe { table::slot_mut(sender_slot).ipc_msg };
            return Ok(Some(msg));
        }
    }

    ch.server.recv_waiting = true;
    ch.server.blocked_slot = Some(server_slot);
    Ok(None)
}

/// Claim the blocked client of `chan` for a reply, clearing the
/// endpoint's waiting state. The caller owns translating the reply and
/// waking the client. A client that died while parked (slot recycled
/// under a new pid) is reported as `NoPeer`.
pub fn take_reply_client(chan: usize) -> KernelResult<usize> {
    let mut ch = channel::lock(chan)?;
    let slot = ch.client.blocked_slot.take().ok_or(IpcError::NoPeer)?;
    ch.client.send_waiting = false;
    ch.client.pending_from = None;
    if table::slot_pid(slot) != ch.client.owner_pid {
        return Err(IpcError::NoPeer.into());
    }
    Ok(slot)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // Rendezvous flag choreography, exercised against real channel slots
    // but synthetic process slots (no scheduler involved).

    #[test]
    fn endpoint_flags_cleared_after_reply_claim() {
        let _g = crate::test_support::GLOBAL_TABLES.lock().unwrap();
        let chan = channel::create().expect("allocate");
        {
            let mut ch = channel::lock(chan).expect("lock");
            ch.client.send_waiting = true;
            ch.client.blocked_slot = Some(3);
            ch.client.pending_from = Some(3);
        }
        let slot = take_reply_client(chan).expect("blocked client present");
        assert_eq!(slot, 3);
        {
            let ch = channel::lock(chan).expect("lock");
            assert!(!ch.client.send_waiting);
            assert!(ch.client.blocked_slot.is_none());
            assert!(ch.client.pending_from.is_none());
        }
        assert!(matches!(
            take_reply_client(chan),
            Err(crate::error::KernelError::Ipc(IpcError::NoPeer))
        ));
        channel::release(chan);
    }
}
