//! File-routing syscalls: namespace-resolved opens, reads and writes
//! over channels, pipes, console fds, and the IPC server interface.
//!
//! Server-backed operations all follow the same shape: stage the request
//! in the caller's `ipc_msg`, record the continuation in `pending`, park
//! on the channel, and let `ipc_reply` translate the server's answer
//! into the caller's syscall return.

use super::{copy_from_user, copy_to_user, read_user_path};
use crate::{
    error::{Errno, FsError, KernelError, KernelResult},
    ipc::{
        self, channel,
        message::{wire, Message, MsgTag, UserMessage, MSG_DATA_MAX},
        pipe,
    },
    process::{fd::NetKind, table, thread, FdKind, PendingOp, ResourceQuotas},
    sched,
};

/// Park the caller on `chan` after its request was staged. Wakes the
/// receiving server (if one is parked in `ipc_recv`) only after this
/// core has left the caller's kernel stack.
fn send_and_block(slot: usize, chan: usize) -> ! {
    match ipc::post_request(chan, slot) {
        Ok(wake) => sched::retire_and_wake(wake),
        Err(_) => {
            // Channel vanished under us: no server will ever answer.
            // SAFETY: we run `slot`.
            let proc = unsafe { table::slot_mut(slot) };
            proc.pending = PendingOp::None;
            proc.pending_ret = Errno::Eio.as_u64();
            sched::retire_and_wake(None)
        }
    }
}

/// The fd kinds the kernel serves itself for well-known paths.
fn intercept_path(path: &str) -> Option<FdKind> {
    match path {
        "/dev/blk0" => Some(FdKind::Blk),
        "/dev/null" => Some(FdKind::DevNull),
        "/dev/zero" => Some(FdKind::DevZero),
        "/dev/random" => Some(FdKind::DevRandom),
        "/dev/cpu" => Some(FdKind::DevCpu),
        "/dev/pci" => Some(FdKind::DevPci),
        "/dev/usb" => Some(FdKind::DevUsb),
        "/dev/mouse" => Some(FdKind::DevMouse),
        "/proc" => Some(FdKind::Proc),
        _ => {
            let kind = match path.strip_prefix("/net/")? {
                "tcp" => NetKind::Tcp,
                "udp" => NetKind::Udp,
                "icmp" => NetKind::Icmp,
                "dns" => NetKind::Dns,
                _ => return None,
            };
            Some(FdKind::Net { kind, conn: 0 })
        }
    }
}

/// Policy check for `max_channels`: may an fd table already holding
/// `held` channel/pipe references take `additional` more?
fn channel_quota_check(
    quotas: &ResourceQuotas,
    held: usize,
    additional: usize,
) -> KernelResult<()> {
    if quotas.allows_channel_refs(held, additional) {
        Ok(())
    } else {
        Err(KernelError::QuotaExceeded {
            resource: "channels",
        })
    }
}

/// Enforce `max_channels` before the caller's fd table takes
/// `additional` new channel/pipe references.
fn check_channel_quota(slot: usize, additional: usize) -> KernelResult<()> {
    // SAFETY: we run `slot`.
    let quotas = unsafe { table::slot_mut(slot) }.quotas;
    let held = thread::with_fds(slot, |fds| fds.channel_refs());
    channel_quota_check(&quotas, held, additional)
}

/// Resolve a path through the caller's namespace.
fn resolve(slot: usize, path: &str) -> KernelResult<(usize, [u8; 256], usize)> {
    thread::with_ns(slot, |ns| {
        let (chan, suffix) = ns.resolve(path).ok_or(FsError::NotFound)?;
        let mut buf = [0u8; 256];
        let n = suffix.len().min(buf.len());
        buf[..n].copy_from_slice(&suffix.as_bytes()[..n]);
        Ok((chan as usize, buf, n))
    })
}

pub(super) fn open(slot: usize, path_ptr: u64, path_len: usize) -> KernelResult<u64> {
    let mut pbuf = [0u8; 256];
    let path = read_user_path(slot, path_ptr, path_len, &mut pbuf)?;

    if let Some(kind) = intercept_path(path) {
        let fd = thread::with_fds(slot, |fds| fds.alloc(kind))
            .ok_or(FsError::TooManyOpenFiles)?;
        return Ok(fd as u64);
    }

    let (chan, suffix, suffix_len) = resolve(slot, path)?;
    check_channel_quota(slot, 1)?;

    let fd = thread::with_fds(slot, |fds| {
        fds.alloc(FdKind::Ipc {
            channel: chan as u32,
            server_side: false,
            server_handle: 0,
            read_offset: 0,
        })
    })
    .ok_or(FsError::TooManyOpenFiles)?;
    channel::retain(chan);

    if channel::kernel_data(chan).is_some() {
        // Kernel-backed: no server round trip, offset starts at zero.
        return Ok(fd as u64);
    }

    // SAFETY: we run `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    proc.ipc_msg = wire::t_open(&suffix[..suffix_len]);
    proc.pending = PendingOp::Open { fd };
    send_and_block(slot, chan)
}

pub(super) fn create(
    slot: usize,
    path_ptr: u64,
    path_len: usize,
    flags: u32,
) -> KernelResult<u64> {
    let mut pbuf = [0u8; 256];
    let path = read_user_path(slot, path_ptr, path_len, &mut pbuf)?;
    let (chan, suffix, suffix_len) = resolve(slot, path)?;
    if channel::kernel_data(chan).is_some() {
        return Err(KernelError::InvalidArgument);
    }
    check_channel_quota(slot, 1)?;

    let fd = thread::with_fds(slot, |fds| {
        fds.alloc(FdKind::Ipc {
            channel: chan as u32,
            server_side: false,
            server_handle: 0,
            read_offset: 0,
        })
    })
    .ok_or(FsError::TooManyOpenFiles)?;
    channel::retain(chan);

    // SAFETY: we run `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    proc.ipc_msg = wire::t_create(flags, &suffix[..suffix_len]);
    proc.pending = PendingOp::Create { fd };
    send_and_block(slot, chan)
}

pub(super) fn read(slot: usize, fd: usize, buf: u64, count: usize) -> KernelResult<u64> {
    let kind = thread::with_fds(slot, |fds| fds.get(fd));
    let Some(kind) = kind else {
        // Default fd 0: the console input ring.
        if fd == 0 {
            return console_read(slot, buf, count);
        }
        return Err(KernelError::BadFd { fd });
    };

    match kind {
        FdKind::Ipc {
            channel,
            server_side,
            server_handle,
            read_offset,
        } => {
            if server_side {
                return Err(KernelError::InvalidArgument);
            }
            let chan = channel as usize;
            if let Some(data) = channel::kernel_data(chan) {
                let at = (read_offset as usize).min(data.len());
                let n = count.min(data.len() - at);
                copy_to_user(slot, buf, &data[at..at + n])?;
                thread::with_fds(slot, |fds| {
                    if let Some(FdKind::Ipc { read_offset, .. }) = fds.get_mut(fd) {
                        *read_offset += n as u32;
                    }
                });
                return Ok(n as u64);
            }
            let count = count.min(MSG_DATA_MAX);
            // SAFETY: we run `slot`.
            let proc = unsafe { table::slot_mut(slot) };
            proc.ipc_msg = wire::t_read(server_handle, read_offset, count as u32);
            proc.pending = PendingOp::Read {
                fd,
                buf,
                len: count,
            };
            send_and_block(slot, chan)
        }
        FdKind::Pipe { pipe, write_end } => {
            if write_end {
                return Err(KernelError::InvalidArgument);
            }
            match sched::attempt_pipe_read(slot, pipe as usize, buf, count) {
                Some(n) => Ok(n),
                None => {
                    // SAFETY: we run `slot`.
                    let proc = unsafe { table::slot_mut(slot) };
                    proc.pending = PendingOp::PipeRead {
                        pipe: pipe as usize,
                        buf,
                        len: count,
                    };
                    sched::block_current()
                }
            }
        }
        FdKind::Net { .. } => Err(KernelError::NotSupported),
        FdKind::Blk => Err(KernelError::InvalidArgument),
        FdKind::DevNull => Ok(0),
        FdKind::DevZero => {
            let zeros = [0u8; 64];
            let mut done = 0;
            while done < count {
                let n = (count - done).min(zeros.len());
                copy_to_user(slot, buf + done as u64, &zeros[..n])?;
                done += n;
            }
            Ok(count as u64)
        }
        FdKind::DevRandom => {
            let mut state = crate::timer::ticks() | 1;
            let mut done = 0;
            let mut chunk = [0u8; 64];
            while done < count {
                let n = (count - done).min(chunk.len());
                for b in chunk[..n].iter_mut() {
                    // xorshift64
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    *b = state as u8;
                }
                copy_to_user(slot, buf + done as u64, &chunk[..n])?;
                done += n;
            }
            Ok(count as u64)
        }
        FdKind::DevCpu | FdKind::Proc => proc_info_read(slot, kind, buf, count),
        // Bus/input pseudo-files are serviced by userspace drivers; the
        // kernel-side fd alone has nothing to read.
        FdKind::DevPci | FdKind::DevUsb | FdKind::DevMouse => Err(KernelError::NotSupported),
    }
}

fn console_read(slot: usize, buf: u64, count: usize) -> KernelResult<u64> {
    match sched::attempt_console_read(slot, buf, count) {
        Some(n) => Ok(n),
        None => {
            // SAFETY: we run `slot`.
            let proc = unsafe { table::slot_mut(slot) };
            proc.pending = PendingOp::ConsoleRead { buf, len: count };
            sched::block_current()
        }
    }
}

/// Tiny text pseudo-files for `/proc` and `/dev/cpu`.
fn proc_info_read(slot: usize, kind: FdKind, buf: u64, count: usize) -> KernelResult<u64> {
    use core::fmt::Write;
    struct Buf {
        bytes: [u8; 128],
        len: usize,
    }
    impl Write for Buf {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let n = s.len().min(self.bytes.len() - self.len);
            self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
            self.len += n;
            Ok(())
        }
    }
    let mut out = Buf {
        bytes: [0; 128],
        len: 0,
    };
    match kind {
        FdKind::DevCpu => {
            let _ = write!(out, "cores {}\n", sched::online_count());
        }
        _ => {
            let _ = write!(out, "procs {}\n", table::MAX_PROCESSES);
        }
    }
    let n = out.len.min(count);
    copy_to_user(slot, buf, &out.bytes[..n])?;
    Ok(n as u64)
}

pub(super) fn write(slot: usize, fd: usize, buf: u64, count: usize) -> KernelResult<u64> {
    let kind = thread::with_fds(slot, |fds| fds.get(fd));
    let Some(kind) = kind else {
        return default_sink_write(slot, fd, buf, count);
    };

    match kind {
        FdKind::Ipc {
            channel,
            server_side,
            server_handle,
            ..
        } => {
            if server_side {
                return Err(KernelError::InvalidArgument);
            }
            let chan = channel as usize;
            if channel::kernel_data(chan).is_some() {
                return Err(KernelError::InvalidArgument);
            }
            let count = count.min(MSG_DATA_MAX - 4);
            let mut data = [0u8; MSG_DATA_MAX];
            copy_from_user(slot, buf, &mut data[..count])?;
            // SAFETY: we run `slot`.
            let proc = unsafe { table::slot_mut(slot) };
            proc.ipc_msg = wire::t_write(server_handle, &data[..count]);
            proc.pending = PendingOp::Write { fd, len: count };
            send_and_block(slot, chan)
        }
        FdKind::Pipe { pipe, write_end } => {
            if !write_end {
                return Err(KernelError::InvalidArgument);
            }
            match sched::attempt_pipe_write(slot, pipe as usize, buf, count) {
                Some(n) => Ok(n),
                None => {
                    // SAFETY: we run `slot`.
                    let proc = unsafe { table::slot_mut(slot) };
                    proc.pending = PendingOp::PipeWrite {
                        pipe: pipe as usize,
                        buf,
                        len: count,
                    };
                    sched::block_current()
                }
            }
        }
        FdKind::Net { .. } => Err(KernelError::NotSupported),
        FdKind::DevNull | FdKind::DevZero => Ok(count as u64),
        FdKind::Blk
        | FdKind::DevRandom
        | FdKind::DevCpu
        | FdKind::Proc
        | FdKind::DevPci
        | FdKind::DevUsb
        | FdKind::DevMouse => Err(KernelError::InvalidArgument),
    }
}

/// fds 0/1/2 without explicit entries have kernel default sinks: fd 0
/// takes console control commands, fd 1/2 go to console output.
fn default_sink_write(slot: usize, fd: usize, buf: u64, count: usize) -> KernelResult<u64> {
    match fd {
        0 => {
            let mut cmd = [0u8; 64];
            let n = count.min(cmd.len());
            copy_from_user(slot, buf, &mut cmd[..n])?;
            // SAFETY: we run `slot`; vt is a plain field.
            let vt = unsafe { table::slot_mut(slot) }.vt;
            crate::drivers::console::control(vt, &cmd[..n]);
            Ok(count as u64)
        }
        1 | 2 => {
            let mut chunk = [0u8; 256];
            let mut done = 0;
            while done < count {
                let n = (count - done).min(chunk.len());
                copy_from_user(slot, buf + done as u64, &mut chunk[..n])?;
                crate::drivers::console::write_output(&chunk[..n]);
                done += n;
            }
            Ok(count as u64)
        }
        _ => Err(KernelError::BadFd { fd }),
    }
}

pub(super) fn close(slot: usize, fd: usize) -> KernelResult<u64> {
    let kind = thread::with_fds(slot, |fds| fds.take(fd)).ok_or(KernelError::BadFd { fd })?;
    crate::process::fd::release_kind(&kind);
    Ok(0)
}

pub(super) fn stat(slot: usize, path_ptr: u64, path_len: usize, buf: u64) -> KernelResult<u64> {
    let mut pbuf = [0u8; 256];
    let path = read_user_path(slot, path_ptr, path_len, &mut pbuf)?;
    let (chan, suffix, suffix_len) = resolve(slot, path)?;

    if let Some(data) = channel::kernel_data(chan) {
        let size = (data.len() as u64).to_le_bytes();
        copy_to_user(slot, buf, &size)?;
        return Ok(size.len() as u64);
    }

    // SAFETY: we run `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    proc.ipc_msg = wire::t_path_only(MsgTag::TStat, &suffix[..suffix_len]);
    proc.pending = PendingOp::Stat { buf, len: 64 };
    send_and_block(slot, chan)
}

pub(super) fn seek(slot: usize, fd: usize, offset: u64, whence: u64) -> KernelResult<u64> {
    thread::with_fds(slot, |fds| match fds.get_mut(fd) {
        Some(FdKind::Ipc {
            channel,
            read_offset,
            server_side: false,
            ..
        }) => {
            let size = channel::kernel_data(*channel as usize).map(|d| d.len() as u64);
            let new = match whence {
                0 => offset,
                1 => (*read_offset as u64).saturating_add(offset),
                2 => size.ok_or(KernelError::InvalidArgument)?.saturating_sub(offset),
                _ => return Err(KernelError::InvalidArgument),
            };
            *read_offset = new.min(u32::MAX as u64) as u32;
            Ok(new)
        }
        Some(_) => Err(KernelError::InvalidArgument),
        None => Err(KernelError::BadFd { fd }),
    })
}

pub(super) fn remove(slot: usize, path_ptr: u64, path_len: usize) -> KernelResult<u64> {
    let mut pbuf = [0u8; 256];
    let path = read_user_path(slot, path_ptr, path_len, &mut pbuf)?;
    let (chan, suffix, suffix_len) = resolve(slot, path)?;
    if channel::kernel_data(chan).is_some() {
        return Err(KernelError::InvalidArgument);
    }

    // SAFETY: we run `slot`.
    let proc = unsafe { table::slot_mut(slot) };
    proc.ipc_msg = wire::t_path_only(MsgTag::TRemove, &suffix[..suffix_len]);
    proc.pending = PendingOp::Remove;
    send_and_block(slot, chan)
}

pub(super) fn mount(
    slot: usize,
    path_ptr: u64,
    path_len: usize,
    chan_fd: usize,
    flags: u32,
) -> KernelResult<u64> {
    let mut pbuf = [0u8; 256];
    let path = read_user_path(slot, path_ptr, path_len, &mut pbuf)?;
    let kind = thread::with_fds(slot, |fds| fds.get(chan_fd))
        .ok_or(KernelError::BadFd { fd: chan_fd })?;
    let FdKind::Ipc { channel, .. } = kind else {
        return Err(KernelError::InvalidArgument);
    };
    let flags = crate::fs::MountFlags::from_bits_truncate(flags);
    thread::with_ns(slot, |ns| ns.mount(path, channel, flags))?;
    Ok(0)
}

pub(super) fn bind(
    slot: usize,
    old_ptr: u64,
    old_len: usize,
    new_ptr: u64,
    new_len: usize,
    flags: u32,
) -> KernelResult<u64> {
    let mut obuf = [0u8; 256];
    let old = read_user_path(slot, old_ptr, old_len, &mut obuf)?;
    let (chan, _suffix, suffix_len) = resolve(slot, old)?;
    if suffix_len != 0 {
        // Only mount roots can be re-bound; a server would have to be
        // asked for a sub-tree handle, which the bind protocol does not
        // carry.
        return Err(KernelError::InvalidArgument);
    }
    let mut nbuf = [0u8; 256];
    let new = read_user_path(slot, new_ptr, new_len, &mut nbuf)?;
    let flags = crate::fs::MountFlags::from_bits_truncate(flags);
    thread::with_ns(slot, |ns| ns.mount(new, chan as u32, flags))?;
    Ok(0)
}

pub(super) fn unmount(slot: usize, path_ptr: u64, path_len: usize) -> KernelResult<u64> {
    let mut pbuf = [0u8; 256];
    let path = read_user_path(slot, path_ptr, path_len, &mut pbuf)?;
    thread::with_ns(slot, |ns| ns.unmount(path))?;
    Ok(0)
}

pub(super) fn pipe(slot: usize, fds_ptr: u64) -> KernelResult<u64> {
    // Both ends land in the caller's fd table.
    check_channel_quota(slot, 2)?;
    let id = pipe::create()?;
    let pair = thread::with_fds(slot, |fds| {
        let r = fds.alloc(FdKind::Pipe {
            pipe: id as u32,
            write_end: false,
        })?;
        match fds.alloc(FdKind::Pipe {
            pipe: id as u32,
            write_end: true,
        }) {
            Some(w) => Some((r, w)),
            None => {
                fds.take(r);
                None
            }
        }
    });
    let Some((r, w)) = pair else {
        // Drop both initial references so the slot frees.
        let mut woken = [0u64; pipe::PIPE_WAITERS];
        pipe::close_end(id, false, &mut woken);
        pipe::close_end(id, true, &mut woken);
        return Err(FsError::TooManyOpenFiles.into());
    };
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&(r as u32).to_le_bytes());
    out[4..].copy_from_slice(&(w as u32).to_le_bytes());
    copy_to_user(slot, fds_ptr, &out)?;
    Ok(0)
}

pub(super) fn pread(
    slot: usize,
    fd: usize,
    buf: u64,
    count: usize,
    offset: u64,
) -> KernelResult<u64> {
    let kind = thread::with_fds(slot, |fds| fds.get(fd)).ok_or(KernelError::BadFd { fd })?;
    match kind {
        // Block storage is served by an external driver; with none
        // registered the partition is unreachable.
        FdKind::Blk => Err(FsError::Io.into()),
        FdKind::Ipc { channel, .. } => {
            let data = channel::kernel_data(channel as usize)
                .ok_or(KernelError::InvalidArgument)?;
            let at = (offset as usize).min(data.len());
            let n = count.min(data.len() - at);
            copy_to_user(slot, buf, &data[at..at + n])?;
            Ok(n as u64)
        }
        _ => Err(KernelError::InvalidArgument),
    }
}

pub(super) fn pwrite(
    slot: usize,
    fd: usize,
    _buf: u64,
    _count: usize,
    _offset: u64,
) -> KernelResult<u64> {
    let kind = thread::with_fds(slot, |fds| fds.get(fd)).ok_or(KernelError::BadFd { fd })?;
    match kind {
        FdKind::Blk => Err(FsError::Io.into()),
        _ => Err(KernelError::InvalidArgument),
    }
}

// ---------------------------------------------------------------------------
// Server-side IPC
// ---------------------------------------------------------------------------

fn ipc_fd_channel(slot: usize, fd: usize) -> KernelResult<usize> {
    match thread::with_fds(slot, |fds| fds.get(fd)) {
        Some(FdKind::Ipc { channel, .. }) => Ok(channel as usize),
        Some(_) => Err(KernelError::InvalidArgument),
        None => Err(KernelError::BadFd { fd }),
    }
}

pub(super) fn ipc_recv(slot: usize, fd: usize, buf: u64) -> KernelResult<u64> {
    let chan = ipc_fd_channel(slot, fd)?;
    match ipc::try_recv(chan, slot)? {
        Some(msg) => {
            let user = UserMessage::from_message(&msg);
            // SAFETY: UserMessage is repr(C) plain bytes.
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    (&user as *const UserMessage).cast::<u8>(),
                    UserMessage::SIZE,
                )
            };
            copy_to_user(slot, buf, bytes)?;
            Ok(msg.data_len as u64)
        }
        None => {
            // SAFETY: we run `slot`.
            let proc = unsafe { table::slot_mut(slot) };
            proc.ipc_recv_buf = buf;
            proc.pending = PendingOp::IpcRecv { channel: chan, buf };
            sched::block_current()
        }
    }
}

pub(super) fn ipc_reply(slot: usize, fd: usize, buf: u64) -> KernelResult<u64> {
    let chan = ipc_fd_channel(slot, fd)?;

    let mut raw = [0u8; UserMessage::SIZE];
    copy_from_user(slot, buf, &mut raw)?;
    // SAFETY: UserMessage is repr(C), any bit pattern is a valid read;
    // `to_message` validates the tag.
    let user = unsafe { core::ptr::read_unaligned(raw.as_ptr().cast::<UserMessage>()) };
    let reply = user.to_message().ok_or(KernelError::InvalidArgument)?;

    let client_slot = ipc::take_reply_client(chan)?;
    let ok = reply.tag != MsgTag::RError;
    deliver_reply(client_slot, chan, reply, ok);
    sched::wake_slot(client_slot);
    Ok(0)
}

/// Translate a server reply into the blocked client's syscall return.
/// Runs under no channel lock; exclusivity comes from having claimed the
/// blocked client in `take_reply_client`.
fn deliver_reply(client_slot: usize, _chan: usize, reply: Message, ok: bool) {
    // SAFETY: the client is Blocked and we are its claimed waker.
    let client = unsafe { table::slot_mut(client_slot) };

    match client.pending {
        PendingOp::Open { fd } | PendingOp::Create { fd } => {
            if ok {
                let handle = reply.lead_u32().unwrap_or(0);
                thread::with_fds(client_slot, |fds| {
                    if let Some(FdKind::Ipc { server_handle, .. }) = fds.get_mut(fd) {
                        *server_handle = handle;
                    }
                });
                client.pending_ret = fd as u64;
            } else {
                // Failed open: release the pre-allocated fd.
                if let Some(kind) = thread::with_fds(client_slot, |fds| fds.take(fd)) {
                    crate::process::fd::release_kind(&kind);
                }
                client.pending_ret = Errno::Enoent.as_u64();
            }
            client.pending = PendingOp::None;
        }

        PendingOp::Read { fd, .. } => {
            if ok {
                thread::with_fds(client_slot, |fds| {
                    if let Some(FdKind::Ipc { read_offset, .. }) = fds.get_mut(fd) {
                        *read_offset += reply.data_len as u32;
                    }
                });
                // Raw bytes are copied by the post-switch hook, in the
                // client's address space.
                client.ipc_pending_msg = Some(reply);
            } else {
                client.pending = PendingOp::None;
                client.pending_ret = Errno::Eio.as_u64();
            }
        }

        PendingOp::Write { len, .. } => {
            client.pending_ret = if ok {
                reply.lead_u32().map(u64::from).unwrap_or(len as u64)
            } else {
                Errno::Eio.as_u64()
            };
            client.pending = PendingOp::None;
        }

        PendingOp::Close { fd } => {
            if let Some(kind) = thread::with_fds(client_slot, |fds| fds.take(fd)) {
                crate::process::fd::release_kind(&kind);
            }
            client.pending_ret = 0;
            client.pending = PendingOp::None;
        }

        PendingOp::Stat { .. } => {
            if ok {
                client.ipc_pending_msg = Some(reply);
            } else {
                client.pending = PendingOp::None;
                client.pending_ret = Errno::Eio.as_u64();
            }
        }

        PendingOp::Remove => {
            client.pending_ret = if ok { 0 } else { Errno::Eio.as_u64() };
            client.pending = PendingOp::None;
        }

        // Raw round trip: deliver the tagged message through the buffer
        // registered by the client's `ipc_recv`.
        PendingOp::IpcRecv { .. } => {
            client.ipc_pending_msg = Some(reply);
        }
        _ => {
            // No recognizable continuation: stage the payload length so
            // the client at least observes completion.
            client.ipc_pending_msg = Some(reply);
            client.pending_ret = reply.data_len as u64;
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn path_interception_table() {
        assert_eq!(intercept_path("/dev/blk0"), Some(FdKind::Blk));
        assert_eq!(intercept_path("/dev/null"), Some(FdKind::DevNull));
        assert!(matches!(
            intercept_path("/net/tcp"),
            Some(FdKind::Net {
                kind: NetKind::Tcp,
                ..
            })
        ));
        assert_eq!(intercept_path("/net/bogus"), None);
        assert_eq!(intercept_path("/boot/init"), None);
    }

    #[test]
    fn channel_quota_rejects_open_past_limit() {
        use crate::process::FdTable;

        let quotas = ResourceQuotas {
            max_channels: 2,
            ..ResourceQuotas::unlimited()
        };
        let mut fds = FdTable::new();

        // Two opens take references the way `open` does.
        for _ in 0..2 {
            channel_quota_check(&quotas, fds.channel_refs(), 1).expect("within quota");
            fds.alloc(FdKind::Ipc {
                channel: 0,
                server_side: false,
                server_handle: 0,
                read_offset: 0,
            });
        }
        // The third is rejected.
        assert!(matches!(
            channel_quota_check(&quotas, fds.channel_refs(), 1),
            Err(KernelError::QuotaExceeded {
                resource: "channels"
            })
        ));

        // Non-channel fds do not count against the quota.
        fds.alloc(FdKind::DevNull);
        assert_eq!(fds.channel_refs(), 2);
    }

    #[test]
    fn pipe_quota_needs_room_for_both_ends() {
        use crate::process::FdTable;

        let quotas = ResourceQuotas {
            max_channels: 2,
            ..ResourceQuotas::unlimited()
        };
        let mut fds = FdTable::new();
        fds.alloc(FdKind::Pipe {
            pipe: 0,
            write_end: false,
        });
        // One slot left but a pipe takes two.
        assert!(channel_quota_check(&quotas, fds.channel_refs(), 2).is_err());
        assert!(channel_quota_check(&quotas, fds.channel_refs(), 1).is_ok());
    }
}
