//! Wire protocol for TriOS-style radiometer modules.
//!
//! The protocol is a length-prefixed binary framing scheme with no trailing
//! delimiter: a start marker, a header byte whose top three bits encode the
//! payload size as `2 * 2^exp`, five more header bytes, the payload, and a
//! checksum. Reserved control bytes inside a frame body travel as two-byte
//! escape sequences.
//!
//! Layer order on the receive path: [`escape`] substitution first (markers
//! can appear escaped), then [`framer`] block extraction, then [`packet`]
//! decode. The [`command`] module builds outbound frames.

pub mod command;
pub mod escape;
pub mod framer;
pub mod packet;

/// Start-of-block marker.
pub const BLOCK_MARKER: u8 = 0x23;

/// Escape introducer for reserved control bytes.
pub const ESCAPE: u8 = 0x40;

/// Software flow control resume.
pub const XON: u8 = 0x11;

/// Software flow control stop.
pub const XOFF: u8 = 0x13;

/// Broadcast channel address reaching every module on a port.
pub const BROADCAST_ADDRESS: u8 = 0x00;

/// Header bytes in a block once the marker is stripped:
/// id1, id2, module-ID, framebyte, two time bytes.
pub(crate) const BLOCK_HEADER_LEN: usize = 6;

/// Block length for a given payload size, marker already stripped:
/// header + payload + checksum.
pub(crate) fn block_len(payload_len: usize) -> usize {
    BLOCK_HEADER_LEN + payload_len + 1
}

/// Payload size in bytes for a size exponent, `2 * 2^exp`.
/// Exponent 7 encodes 256 which the protocol rejects as invalid.
pub(crate) fn payload_len(size_exponent: u8) -> usize {
    2 * (1usize << size_exponent)
}
