//! In-memory kernel log.
//!
//! A fixed byte ring fed by the `log` facade. Every record is formatted
//! into the ring; records at or above the emit threshold are also written
//! to the serial console immediately. The ring is served to userspace by
//! the `klog` syscall: the caller passes a byte offset into the log
//! stream and the kernel clamps it to the earliest byte still present.

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

/// Bytes retained in the ring.
const KLOG_CAPACITY: usize = 32 * 1024;

/// Longest single formatted record; longer records are truncated.
const LINE_MAX: usize = 256;

/// Records at or above this level are mirrored to serial as they arrive.
const EMIT_LEVEL: log::Level = log::Level::Info;

struct KlogRing {
    buf: [u8; KLOG_CAPACITY],
    /// Total bytes ever written; the ring holds the last `KLOG_CAPACITY`.
    head: u64,
}

impl KlogRing {
    const fn new() -> Self {
        Self {
            buf: [0; KLOG_CAPACITY],
            head: 0,
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.buf[(self.head % KLOG_CAPACITY as u64) as usize] = b;
            self.head += 1;
        }
    }

    /// Copy a window starting at `offset` into `out`. Returns the clamped
    /// offset actually served and the number of bytes copied.
    fn read_window(&self, offset: u64, out: &mut [u8]) -> (u64, usize) {
        let earliest = self.head.saturating_sub(KLOG_CAPACITY as u64);
        let start = offset.clamp(earliest, self.head);
        let avail = (self.head - start) as usize;
        let n = avail.min(out.len());
        for (i, slot) in out.iter_mut().enumerate().take(n) {
            *slot = self.buf[((start + i as u64) % KLOG_CAPACITY as u64) as usize];
        }
        (start, n)
    }
}

static RING: Mutex<KlogRing> = Mutex::new(KlogRing::new());

/// Fixed-size formatting buffer; drops bytes past `LINE_MAX`.
struct LineBuf {
    bytes: [u8; LINE_MAX],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            bytes: [0; LINE_MAX],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        // SAFETY: only `write_str` appends, and it copies whole str bytes;
        // truncation below happens at a char boundary check.
        unsafe { core::str::from_utf8_unchecked(&self.bytes[..self.len]) }
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_MAX - self.len;
        let mut take = s.len().min(room);
        // Back off to a char boundary when truncating.
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

struct KlogSink;

impl log::Log for KlogSink {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut line = LineBuf::new();
        let _ = write!(
            line,
            "[{:>5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
        RING.lock().append(line.as_str().as_bytes());
        if record.level() <= EMIT_LEVEL {
            crate::arch::debug_write_str(line.as_str());
        }
    }

    fn flush(&self) {}
}

static SINK: KlogSink = KlogSink;

/// Install the ring as the `log` sink. Called once during bootstrap.
pub fn init() {
    if log::set_logger(&SINK).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Serve a window of the log stream; see module docs.
pub fn read_window(offset: u64, out: &mut [u8]) -> (u64, usize) {
    RING.lock().read_window(offset, out)
}

/// Total bytes ever logged (the stream position of the next byte).
pub fn stream_head() -> u64 {
    RING.lock().head
}

/// Write a raw line into the ring without going through the facade. Used
/// by the panic path, which cannot rely on the logger being installed.
pub fn raw_append(s: &str) {
    RING.lock().append(s.as_bytes());
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn window_clamps_to_earliest_retained_byte() {
        let mut ring = KlogRing::new();
        ring.append(b"hello");
        let mut out = [0u8; 16];
        let (start, n) = ring.read_window(0, &mut out);
        assert_eq!((start, n), (0, 5));
        assert_eq!(&out[..5], b"hello");

        // Overflow the ring; offset 0 is no longer present.
        let big = [b'x'; KLOG_CAPACITY];
        ring.append(&big);
        let (start, _) = ring.read_window(0, &mut out);
        assert_eq!(start, ring.head - KLOG_CAPACITY as u64);
    }

    #[test]
    fn window_past_head_returns_empty() {
        let mut ring = KlogRing::new();
        ring.append(b"abc");
        let mut out = [0u8; 8];
        let (start, n) = ring.read_window(100, &mut out);
        assert_eq!(start, 3);
        assert_eq!(n, 0);
    }

    #[test]
    fn line_buf_truncates_on_char_boundary() {
        let mut line = LineBuf::new();
        let long = "é".repeat(200);
        let _ = write!(line, "{}", long);
        assert!(line.len <= LINE_MAX);
        assert!(core::str::from_utf8(&line.bytes[..line.len]).is_ok());
    }

    #[test]
    fn ring_keeps_most_recent_bytes() {
        let mut ring = KlogRing::new();
        for i in 0..KLOG_CAPACITY + 10 {
            ring.append(&[(i % 251) as u8]);
        }
        let mut out = [0u8; 4];
        let (start, n) = ring.read_window(0, &mut out);
        assert_eq!(n, 4);
        assert_eq!(out[0], (start % 251) as u8);
    }
}
