//! PS/2 keyboard input (x86_64).
//!
//! IRQ 1 scancodes are decoded with scancode set 1 and fed into the
//! active VT's input ring. Everything beyond decoding lives in the
//! console sink.

use pc_keyboard::{layouts::Us104Key, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;

use super::console;

static KEYBOARD: Mutex<Keyboard<Us104Key, ScancodeSet1>> = Mutex::new(Keyboard::new(
    ScancodeSet1::new(),
    Us104Key,
    HandleControl::MapLettersToUnicode,
));

/// Handle one scancode from the IRQ 1 handler.
pub fn handle_scancode(scancode: u8) {
    let mut kb = KEYBOARD.lock();
    let Ok(Some(event)) = kb.add_byte(scancode) else {
        return;
    };
    let Some(key) = kb.process_keyevent(event) else {
        return;
    };
    drop(kb);

    let vt = console::active_vt();
    match key {
        DecodedKey::Unicode(ch) => {
            let mut buf = [0u8; 4];
            for &b in ch.encode_utf8(&mut buf).as_bytes() {
                console::feed_input(vt, b);
            }
        }
        DecodedKey::RawKey(_) => {}
    }
}
