//! Console sink: per-VT input rings and the fd-0 control channel.
//!
//! Rendering is a userspace concern; what the kernel keeps is input
//! plumbing. Each virtual terminal has an input ring fed by the keyboard
//! driver, a line buffer for cooked mode, and a bounded list of blocked
//! readers. Output written to fd 1/2 is forwarded to serial with the
//! ANSI CSI subset stripped.
//!
//! Writes to fd 0 (with no explicit fd entry) are control commands:
//! `rawon`, `rawoff`, `echo on`, `echo off`, `size`, `vt N`.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::sync::TicketMutex;

/// Number of virtual terminals.
pub const MAX_VTS: usize = 4;

/// Input ring bytes per VT.
const INPUT_RING: usize = 256;

/// Cooked-mode line buffer.
const LINE_MAX: usize = 128;

/// Blocked readers remembered per VT; overflow overwrites slot 0.
const CONSOLE_WAITERS: usize = 4;

/// Reported terminal geometry.
const COLS: usize = 80;
const ROWS: usize = 25;

struct Vt {
    ring: [u8; INPUT_RING],
    head: usize,
    count: usize,
    line: [u8; LINE_MAX],
    line_len: usize,
    raw: bool,
    echo: bool,
    waiters: [Option<u64>; CONSOLE_WAITERS],
}

impl Vt {
    const fn new() -> Self {
        Self {
            ring: [0; INPUT_RING],
            head: 0,
            count: 0,
            line: [0; LINE_MAX],
            line_len: 0,
            raw: false,
            echo: true,
            waiters: [None; CONSOLE_WAITERS],
        }
    }

    fn push_ring(&mut self, b: u8) {
        if self.count == INPUT_RING {
            return; // drop input on overflow
        }
        self.ring[(self.head + self.count) % INPUT_RING] = b;
        self.count += 1;
    }

    fn pop_ring(&mut self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let b = self.ring[self.head];
        self.head = (self.head + 1) % INPUT_RING;
        self.count -= 1;
        Some(b)
    }

    fn add_waiter(&mut self, pid: u64) {
        for slot in self.waiters.iter_mut() {
            if slot.is_none() || *slot == Some(pid) {
                *slot = Some(pid);
                return;
            }
        }
        self.waiters[0] = Some(pid);
    }

    fn drain_waiters(&mut self, out: &mut [u64; CONSOLE_WAITERS]) -> usize {
        let mut n = 0;
        for slot in self.waiters.iter_mut() {
            if let Some(pid) = slot.take() {
                out[n] = pid;
                n += 1;
            }
        }
        n
    }
}

static VTS: [TicketMutex<Vt>; MAX_VTS] = [const { TicketMutex::new(Vt::new()) }; MAX_VTS];

static ACTIVE_VT: AtomicUsize = AtomicUsize::new(0);

/// The VT currently receiving keyboard input.
pub fn active_vt() -> usize {
    ACTIVE_VT.load(Ordering::Acquire)
}

/// Feed one decoded input byte into `vt`. Raw mode delivers immediately;
/// cooked mode line-buffers until newline, handling backspace. Returns
/// readers to wake.
pub fn feed_input(vt: usize, byte: u8) {
    let mut woken = [0u64; CONSOLE_WAITERS];
    let mut n_woken = 0;
    {
        let mut t = VTS[vt % MAX_VTS].lock();
        if t.echo {
            if byte == 8 || byte == 127 {
                // Erase visually: BS, space, BS.
                crate::arch::debug_write_str("\u{8} \u{8}");
            } else {
                crate::arch::debug_write_bytes(&[byte]);
            }
        }
        if t.raw {
            t.push_ring(byte);
            n_woken = t.drain_waiters(&mut woken);
        } else {
            match byte {
                8 | 127 => {
                    t.line_len = t.line_len.saturating_sub(1);
                }
                b'\n' | b'\r' => {
                    for i in 0..t.line_len {
                        let b = t.line[i];
                        t.push_ring(b);
                    }
                    t.push_ring(b'\n');
                    t.line_len = 0;
                    n_woken = t.drain_waiters(&mut woken);
                }
                _ => {
                    if t.line_len < LINE_MAX {
                        let at = t.line_len;
                        t.line[at] = byte;
                        t.line_len += 1;
                    }
                }
            }
        }
    }
    for &pid in &woken[..n_woken] {
        crate::sched::wake_pid(pid);
    }
}

/// Drain up to `buf.len()` input bytes from `vt`'s ring.
pub fn read_input(vt: usize, buf: &mut [u8]) -> usize {
    let mut t = VTS[vt % MAX_VTS].lock();
    let mut n = 0;
    while n < buf.len() {
        match t.pop_ring() {
            Some(b) => {
                buf[n] = b;
                n += 1;
            }
            None => break,
        }
    }
    n
}

/// Register a blocked reader of `vt`.
pub fn add_waiter(vt: usize, pid: u64) {
    VTS[vt % MAX_VTS].lock().add_waiter(pid);
}

/// Handle a control command written to fd 0. Unknown commands are
/// silently ignored, matching the tolerant console protocol.
pub fn control(vt: usize, cmd: &[u8]) {
    let cmd = core::str::from_utf8(cmd).unwrap_or("").trim();
    let mut woken = [0u64; CONSOLE_WAITERS];
    let mut n_woken = 0;
    {
        let mut t = VTS[vt % MAX_VTS].lock();
        match cmd {
            "rawon" => t.raw = true,
            "rawoff" => {
                t.raw = false;
                t.line_len = 0;
            }
            "echo on" => t.echo = true,
            "echo off" => t.echo = false,
            "size" => {
                // Answer lands in the input ring: "<cols> <rows>\n".
                let mut buf = [0u8; 16];
                let s = format_size(&mut buf);
                for &b in s {
                    t.push_ring(b);
                }
                n_woken = t.drain_waiters(&mut woken);
            }
            _ => {
                if let Some(n) = cmd.strip_prefix("vt ") {
                    if let Ok(idx) = n.trim().parse::<usize>() {
                        if idx < MAX_VTS {
                            ACTIVE_VT.store(idx, Ordering::Release);
                        }
                    }
                }
            }
        }
    }
    for &pid in &woken[..n_woken] {
        crate::sched::wake_pid(pid);
    }
}

fn format_size(buf: &mut [u8; 16]) -> &[u8] {
    // Hand-rolled to stay allocation-free: "<cols> <rows>\n".
    let mut n = 0;
    for part in [COLS, ROWS] {
        if n > 0 {
            buf[n] = b' ';
            n += 1;
        }
        let mut digits = [0u8; 8];
        let mut d = 0;
        let mut v = part;
        loop {
            digits[d] = b'0' + (v % 10) as u8;
            v /= 10;
            d += 1;
            if v == 0 {
                break;
            }
        }
        while d > 0 {
            d -= 1;
            buf[n] = digits[d];
            n += 1;
        }
    }
    buf[n] = b'\n';
    n += 1;
    &buf[..n]
}

/// Forward console output to serial, accepting and stripping the ANSI
/// CSI subset (cursor movement `A B C D H f`, erase `J K`, SGR `m`).
pub fn write_output(bytes: &[u8]) {
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == 0x1b && bytes.get(i + 1) == Some(&b'[') {
            // Skip parameters up to and including the final byte.
            let mut j = i + 2;
            while j < bytes.len() && !(0x40..=0x7e).contains(&bytes[j]) {
                j += 1;
            }
            i = (j + 1).min(bytes.len());
            continue;
        }
        crate::arch::debug_write_bytes(&[b]);
        i += 1;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // Tests use distinct VTs to avoid interfering with each other; the
    // table is global.

    #[test]
    fn cooked_mode_line_editing() {
        feed_input(1, b'h');
        feed_input(1, b'i');
        let mut buf = [0u8; 8];
        assert_eq!(read_input(1, &mut buf), 0, "line not yet complete");
        feed_input(1, b'\n');
        let n = read_input(1, &mut buf);
        assert_eq!(&buf[..n], b"hi\n");

        // Backspace edits the pending line before delivery.
        feed_input(1, b'a');
        feed_input(1, b'b');
        feed_input(1, 127);
        feed_input(1, b'\n');
        let n = read_input(1, &mut buf);
        assert_eq!(&buf[..n], b"a\n");
    }

    #[test]
    fn raw_mode_delivers_immediately() {
        control(2, b"rawon");
        control(2, b"echo off");
        feed_input(2, b'x');
        let mut buf = [0u8; 4];
        assert_eq!(read_input(2, &mut buf), 1);
        assert_eq!(buf[0], b'x');
        control(2, b"rawoff");
    }

    #[test]
    fn size_command_reports_geometry() {
        control(3, b"size");
        let mut buf = [0u8; 16];
        let n = read_input(3, &mut buf);
        assert_eq!(&buf[..n], b"80 25\n");
    }

    #[test]
    fn vt_switch_clamps_to_range() {
        control(0, b"vt 2");
        assert_eq!(active_vt(), 2);
        control(0, b"vt 99");
        assert_eq!(active_vt(), 2);
        control(0, b"vt 0");
        assert_eq!(active_vt(), 0);
    }
}
