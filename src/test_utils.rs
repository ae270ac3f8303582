//! Test utilities: scripted serial links and wire-frame builders.
//!
//! `MockLink` stands in for a physical serial port. Bytes queued on it come
//! back out of `read_available`, writes are logged, and an optional responder
//! closure turns outbound commands into scripted sensor replies, which is
//! enough to drive the whole fleet lifecycle without hardware.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use crate::config::FleetConfig;
use crate::power::PowerSwitch;
use crate::protocol::BLOCK_MARKER;
use crate::protocol::escape::{Unescaper, escape};
use crate::serial::{LinkFactory, SerialLink};
use crate::Result;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// A scripted in-memory serial link.
pub struct MockLink {
    reads: Arc<Mutex<VecDeque<u8>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    responder: Option<Responder>,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            reads: Arc::new(Mutex::new(VecDeque::new())),
            writes: Arc::new(Mutex::new(Vec::new())),
            responder: None,
        }
    }

    /// Queue bytes to be returned by subsequent reads.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.reads.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Shared handle to the read queue, for feeding data after the link has
    /// been handed to a listener.
    pub fn read_queue(&self) -> Arc<Mutex<VecDeque<u8>>> {
        Arc::clone(&self.reads)
    }

    /// Shared log of every write, one entry per `write_all` call.
    pub fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.writes)
    }

    /// Install a responder: its return bytes are queued as if the sensor
    /// replied to the written command.
    pub fn respond_with(mut self, responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialLink for MockLink {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reads = self.reads.lock().unwrap();
        let n = buf.len().min(reads.len());
        for slot in buf.iter_mut().take(n) {
            *slot = reads.pop_front().expect("length checked");
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writes.lock().unwrap().push(bytes.to_vec());
        if let Some(responder) = self.responder.as_mut() {
            let reply = responder(bytes);
            self.reads.lock().unwrap().extend(reply);
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Factory producing a fresh scripted link per port.
pub struct MockFactory {
    build: Box<dyn Fn(&str) -> MockLink + Send + Sync>,
}

impl MockFactory {
    pub fn new(build: impl Fn(&str) -> MockLink + Send + Sync + 'static) -> Self {
        Self { build: Box::new(build) }
    }
}

impl LinkFactory for MockFactory {
    fn open(&self, port: &str, _config: &FleetConfig) -> Result<Box<dyn SerialLink>> {
        Ok(Box::new((self.build)(port)))
    }
}

/// Power switch that records every pin transition.
pub struct CountingPower {
    pub events: Arc<Mutex<Vec<(u8, bool)>>>,
}

impl CountingPower {
    pub fn new() -> (Self, Arc<Mutex<Vec<(u8, bool)>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (Self { events: Arc::clone(&events) }, events)
    }
}

impl PowerSwitch for CountingPower {
    fn set(&mut self, pin: u8, on: bool) -> Result<()> {
        self.events.lock().unwrap().push((pin, on));
        Ok(())
    }
}

/// Build a complete wire frame: marker, escaped header/payload/checksum.
/// The size exponent is derived from the payload length, which must be a
/// valid `2 * 2^e` size.
pub fn wire_frame(id2: u8, module_id: u8, framebyte: u8, payload: &[u8]) -> Vec<u8> {
    let exp = (0u8..=6)
        .find(|e| 2 * (1usize << e) == payload.len())
        .expect("payload length must be 2*2^e for e in 0..=6");
    let mut body = vec![exp << 5, id2, module_id, framebyte, 0x00, 0x00];
    body.extend_from_slice(payload);
    body.push(0x00);

    let mut frame = vec![BLOCK_MARKER];
    frame.extend(escape(&body));
    frame
}

/// Query-reply payload: serial word, firmware, frequency index, settings.
pub fn query_reply_payload(
    serial: u16,
    fw_int: u8,
    fw_frac: u8,
    freq_idx: u8,
    settings: u8,
) -> [u8; 8] {
    let [serial_lo, serial_hi] = serial.to_le_bytes();
    [serial_lo, serial_hi, fw_frac, fw_int, freq_idx, settings, 0, 0]
}

/// A SAM measurement frame whose payload is the given words, little endian.
pub fn sam_frame(id2: u8, framebyte: u8, words: &[u16]) -> Vec<u8> {
    let payload: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    wire_frame(id2, 0x00, framebyte, &payload)
}

/// Split a raw outbound write back into unescaped frame bodies. Command
/// bodies never contain a literal marker, so splitting on markers is exact.
pub fn decode_frames(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut starts: Vec<usize> = bytes
        .iter()
        .enumerate()
        .filter(|(_, &b)| b == BLOCK_MARKER)
        .map(|(i, _)| i)
        .collect();
    starts.push(bytes.len());

    let mut frames = Vec::new();
    for window in starts.windows(2) {
        let mut unescaper = Unescaper::new();
        let mut body = Vec::new();
        unescaper.push(&bytes[window[0] + 1..window[1]], &mut body);
        frames.push(body);
    }
    frames
}

/// Scripted sensor rail: one SAM module answering queries and, when
/// `answer_triggers` is true, integration triggers.
pub fn sam_rail_responder(
    address: u8,
    serial: u16,
    answer_triggers: Arc<std::sync::atomic::AtomicBool>,
) -> impl FnMut(&[u8]) -> Vec<u8> + Send {
    use crate::protocol::command::{OP_QUERY, OP_TRIGGER};
    use std::sync::atomic::Ordering;

    move |written| {
        let mut reply = Vec::new();
        for frame in decode_frames(written) {
            match frame.get(3) {
                Some(&OP_QUERY) => {
                    reply.extend(wire_frame(
                        address,
                        0x00,
                        255,
                        &query_reply_payload(serial, 2, 15, 4, 0x01),
                    ));
                }
                Some(&OP_TRIGGER) if answer_triggers.load(Ordering::Acquire) => {
                    for fb in (1u8..=7).rev() {
                        reply.extend(sam_frame(address, fb, &[u16::from(fb)]));
                    }
                    reply.extend(sam_frame(address, 0, &[0]));
                }
                _ => {}
            }
        }
        reply
    }
}
