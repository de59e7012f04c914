// COM1 serial output.

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    static ref COM1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 port block; nothing else in
        // the kernel touches it.
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

pub fn write_str(s: &str) {
    let mut port = COM1.lock();
    for b in s.bytes() {
        port.send(b);
    }
}

pub fn write_bytes(bytes: &[u8]) {
    let mut port = COM1.lock();
    for &b in bytes {
        port.send_raw(b);
    }
}
