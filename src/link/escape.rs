//! Byte stuffing for response payloads.
//!
//! Frames on the link are terminated by `\r`, but response payloads carry
//! arbitrary 8-bit data.  The transceiver escapes payloads before framing
//! them and the host applies the inverse, so no bare `\r` ever appears
//! inside an `r` frame.
//!
//! The scheme reserves two bytes.  Each is replaced by the escape lead-in
//! followed by the original value plus 0x40:
//!
//! ```text
//! 0x0d (\r)  ->  0x1b 0x4d
//! 0x1b (ESC) ->  0x1b 0x5b
//! ```

use crate::error::{Error, Result};

/// Escape lead-in byte
pub const ESCAPE: u8 = 0x1b;

/// Frame terminator, the one byte that must never appear in a payload
pub const TERMINATOR: u8 = b'\r';

const OFFSET: u8 = 0x40;

/// Escape `data` so it contains neither [`TERMINATOR`] nor a bare
/// [`ESCAPE`].
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            TERMINATOR | ESCAPE => {
                out.push(ESCAPE);
                out.push(b.wrapping_add(OFFSET));
            }
            b => out.push(b),
        }
    }
    out
}

/// Invert [`escape`].  Fails on a trailing lead-in or an unknown escape
/// pair, both of which indicate a framing bug on the other side.
pub fn unescape(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(&e) => {
                let original = e.wrapping_sub(OFFSET);
                if original != TERMINATOR && original != ESCAPE {
                    return Err(Error::Connection {
                        message: format!("invalid escape pair 0x{ESCAPE:02x} 0x{e:02x}"),
                    });
                }
                out.push(original);
            }
            None => {
                return Err(Error::Connection {
                    message: "dangling escape byte at end of payload".to_string(),
                })
            }
        }
    }
    Ok(out)
}
