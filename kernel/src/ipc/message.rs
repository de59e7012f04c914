//! IPC message format.
//!
//! Tags and wire encodings are fixed protocol: userspace file servers are
//! built against these exact values.

/// Maximum inline payload per message.
pub const MSG_DATA_MAX: usize = 4096;

/// Message tags. Requests are `T*`, replies `R*`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgTag {
    TOpen = 1,
    TRead = 2,
    TWrite = 3,
    TClose = 4,
    TStat = 5,
    TCtl = 6,
    TCreate = 7,
    TRemove = 8,
    TRename = 9,
    TTruncate = 10,
    TWstat = 11,
    ROk = 128,
    RError = 129,
}

impl MsgTag {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::TOpen,
            2 => Self::TRead,
            3 => Self::TWrite,
            4 => Self::TClose,
            5 => Self::TStat,
            6 => Self::TCtl,
            7 => Self::TCreate,
            8 => Self::TRemove,
            9 => Self::TRename,
            10 => Self::TTruncate,
            11 => Self::TWstat,
            128 => Self::ROk,
            129 => Self::RError,
            _ => return None,
        })
    }
}

/// One IPC message: tag, inline payload, optional delegated channel.
///
/// Messages are plain values; rendezvous copies them between process
/// structs and user buffers, never shares them.
#[derive(Clone, Copy)]
pub struct Message {
    pub tag: MsgTag,
    pub data_len: usize,
    pub data: [u8; MSG_DATA_MAX],
    /// Channel id passed along for delegation, if any.
    pub passed_channel: Option<u32>,
}

impl Message {
    pub const fn new(tag: MsgTag) -> Self {
        Self {
            tag,
            data_len: 0,
            data: [0; MSG_DATA_MAX],
            passed_channel: None,
        }
    }

    /// Build a message carrying `bytes`, truncated to the inline buffer.
    pub fn with_data(tag: MsgTag, bytes: &[u8]) -> Self {
        let mut msg = Self::new(tag);
        msg.append(bytes);
        msg
    }

    /// Append bytes to the payload, silently clipping at the buffer end.
    pub fn append(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(MSG_DATA_MAX - self.data_len);
        self.data[self.data_len..self.data_len + n].copy_from_slice(&bytes[..n]);
        self.data_len += n;
    }

    /// Append a little-endian u32.
    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_le_bytes());
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data_len]
    }

    /// First 4 payload bytes as a little-endian u32, if present.
    pub fn lead_u32(&self) -> Option<u32> {
        if self.data_len < 4 {
            return None;
        }
        Some(u32::from_le_bytes([
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ]))
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new(MsgTag::ROk)
    }
}

/// The fixed-layout view of a message exchanged with userspace by
/// `ipc_recv` / `ipc_reply`. Identical field order on every architecture.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UserMessage {
    pub tag: u32,
    pub data_len: u32,
    pub passed_channel: u32,
    pub _reserved: u32,
    pub data: [u8; MSG_DATA_MAX],
}

impl UserMessage {
    pub const SIZE: usize = 16 + MSG_DATA_MAX;

    pub fn from_message(msg: &Message) -> Self {
        let mut out = Self {
            tag: msg.tag as u32,
            data_len: msg.data_len as u32,
            passed_channel: msg.passed_channel.map(|c| c + 1).unwrap_or(0),
            _reserved: 0,
            data: [0; MSG_DATA_MAX],
        };
        out.data[..msg.data_len].copy_from_slice(msg.payload());
        out
    }

    pub fn to_message(&self) -> Option<Message> {
        let tag = MsgTag::from_u32(self.tag)?;
        let len = (self.data_len as usize).min(MSG_DATA_MAX);
        let mut msg = Message::with_data(tag, &self.data[..len]);
        msg.passed_channel = match self.passed_channel {
            0 => None,
            c => Some(c - 1),
        };
        Some(msg)
    }
}

/// Encoders for the kernel→server request shapes of the file protocol.
pub mod wire {
    use super::{Message, MsgTag};

    pub fn t_open(suffix: &[u8]) -> Message {
        Message::with_data(MsgTag::TOpen, suffix)
    }

    pub fn t_create(flags: u32, suffix: &[u8]) -> Message {
        let mut msg = Message::new(MsgTag::TCreate);
        msg.append_u32(flags);
        msg.append(suffix);
        msg
    }

    pub fn t_read(handle: u32, offset: u32, count: u32) -> Message {
        let mut msg = Message::new(MsgTag::TRead);
        msg.append_u32(handle);
        msg.append_u32(offset);
        msg.append_u32(count);
        msg
    }

    pub fn t_write(handle: u32, payload: &[u8]) -> Message {
        let mut msg = Message::new(MsgTag::TWrite);
        msg.append_u32(handle);
        msg.append(payload);
        msg
    }

    pub fn t_handle_only(tag: MsgTag, handle: u32) -> Message {
        let mut msg = Message::new(tag);
        msg.append_u32(handle);
        msg
    }

    pub fn t_path_only(tag: MsgTag, suffix: &[u8]) -> Message {
        Message::with_data(tag, suffix)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn tag_values_are_wire_stable() {
        assert_eq!(MsgTag::TOpen as u32, 1);
        assert_eq!(MsgTag::TWstat as u32, 11);
        assert_eq!(MsgTag::ROk as u32, 128);
        assert_eq!(MsgTag::RError as u32, 129);
        assert_eq!(MsgTag::from_u32(2), Some(MsgTag::TRead));
        assert_eq!(MsgTag::from_u32(127), None);
    }

    #[test]
    fn payload_clips_at_buffer_end() {
        let big = [7u8; MSG_DATA_MAX + 100];
        let msg = Message::with_data(MsgTag::TWrite, &big);
        assert_eq!(msg.data_len, MSG_DATA_MAX);
    }

    #[test]
    fn t_read_encoding() {
        let msg = wire::t_read(3, 4096, 64);
        assert_eq!(msg.tag, MsgTag::TRead);
        assert_eq!(msg.data_len, 12);
        assert_eq!(msg.lead_u32(), Some(3));
        assert_eq!(&msg.data[4..8], &4096u32.to_le_bytes());
        assert_eq!(&msg.data[8..12], &64u32.to_le_bytes());
    }

    #[test]
    fn user_message_round_trip() {
        let mut msg = Message::with_data(MsgTag::TWrite, b"payload");
        msg.passed_channel = Some(0);
        let user = UserMessage::from_message(&msg);
        let back = user.to_message().expect("valid tag");
        assert_eq!(back.tag, MsgTag::TWrite);
        assert_eq!(back.payload(), b"payload");
        assert_eq!(back.passed_channel, Some(0));

        // Channel id 0 must survive the 0-means-none encoding.
        let plain = Message::new(MsgTag::ROk);
        let user = UserMessage::from_message(&plain);
        assert_eq!(user.passed_channel, 0);
        assert_eq!(user.to_message().expect("valid").passed_channel, None);
    }
}
