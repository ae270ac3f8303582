//! Escape substitution for reserved control bytes.
//!
//! Four byte values never appear literally inside a frame body: XON, XOFF,
//! the block marker, and the escape introducer itself. A sender replaces each
//! with the escape byte followed by the literal with its top bit set. The
//! receive path must undo this before searching for markers, because a marker
//! byte inside a payload arrives escaped.

use super::{BLOCK_MARKER, ESCAPE, XOFF, XON};

const RESERVED: [u8; 4] = [XON, XOFF, BLOCK_MARKER, ESCAPE];

/// Escape a frame body for transmission.
pub fn escape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for &b in body {
        if RESERVED.contains(&b) {
            out.push(ESCAPE);
            out.push(b | 0x80);
        } else {
            out.push(b);
        }
    }
    out
}

/// Streaming unescaper.
///
/// An escape sequence can straddle a read boundary, so a trailing lone escape
/// byte is held back until the next push delivers its partner.
#[derive(Debug, Default)]
pub struct Unescaper {
    pending_escape: bool,
}

impl Unescaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `input`, appending literal bytes to `out`.
    ///
    /// An escape introducer followed by anything other than a reserved
    /// literal is passed through untouched; garbled streams are the framer's
    /// problem, not ours.
    pub fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            if self.pending_escape {
                self.pending_escape = false;
                let literal = b & 0x7F;
                if b & 0x80 != 0 && RESERVED.contains(&literal) {
                    out.push(literal);
                } else {
                    out.push(ESCAPE);
                    out.push(b);
                }
            } else if b == ESCAPE {
                self.pending_escape = true;
            } else {
                out.push(b);
            }
            i += 1;
        }
    }

    /// Drop any held-back escape byte.
    pub fn reset(&mut self) {
        self.pending_escape = false;
    }
}
