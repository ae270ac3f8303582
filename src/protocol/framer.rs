//! Byte-stream framer.
//!
//! Extracts protocol blocks from an accumulating byte stream. There is no
//! trailing delimiter: a block is the start marker, one header byte whose top
//! three bits give the payload size, five further header bytes, the payload,
//! and a checksum. Anything before the first marker is a truncated or garbled
//! tail and is silently dropped — lossy resynchronization is the protocol's
//! recovery policy.

use tracing::trace;

use super::escape::Unescaper;
use super::{BLOCK_MARKER, block_len, payload_len};
use crate::{AcquisitionError, Result};

/// Extract at most one block from `buf`, consuming what it uses.
///
/// Returns `Ok(Some(block))` with the marker stripped, `Ok(None)` when more
/// bytes are needed, and a [`FramingError`](AcquisitionError::Framing) for an
/// invalid size code (the stream is resynchronized past the bad marker).
/// Never blocks; pure with respect to the buffer contents.
pub fn extract_block(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    let Some(marker_at) = buf.iter().position(|&b| b == BLOCK_MARKER) else {
        buf.clear();
        return Ok(None);
    };
    if marker_at > 0 {
        trace!(dropped = marker_at, "discarding bytes before block marker");
        buf.drain(..marker_at);
    }

    // buf[0] is the marker; buf[1] carries the size code.
    if buf.len() < 2 {
        return Ok(None);
    }
    let size_exponent = buf[1] >> 5;
    let payload = payload_len(size_exponent);
    if payload == 256 {
        buf.drain(..2);
        return Err(AcquisitionError::framing(format!(
            "size exponent {size_exponent} encodes a 256-byte payload"
        )));
    }

    let needed = 1 + block_len(payload);
    if buf.len() < needed {
        return Ok(None);
    }

    let block = buf[1..needed].to_vec();
    buf.drain(..needed);
    Ok(Some(block))
}

/// Stateful framer: feed raw serial bytes in, get unescaped blocks out.
///
/// Unescaping runs before marker search because markers can appear escaped
/// inside a frame body.
#[derive(Debug, Default)]
pub struct BlockFramer {
    buf: Vec<u8>,
    unescaper: Unescaper,
}

impl BlockFramer {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(512), unescaper: Unescaper::new() }
    }

    /// Ingest newly read bytes and return every block (or framing error)
    /// they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>>> {
        self.unescaper.push(bytes, &mut self.buf);
        let mut out = Vec::new();
        loop {
            match extract_block(&mut self.buf) {
                Ok(Some(block)) => out.push(Ok(block)),
                Ok(None) => break,
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    /// Bytes buffered waiting for a complete block.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Clear all buffered state (stalled-stream recovery).
    pub fn reset(&mut self) {
        self.buf.clear();
        self.unescaper.reset();
    }
}
