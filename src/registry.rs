//! Per-sensor channel state.
//!
//! The registry maps `(port, TID)` to everything known about a sensor:
//! identity from its query reply, the last command issued to it, failure
//! bookkeeping, and the measurement buffer appropriate to its module type.
//! Entries are created when a query reply first identifies an address and
//! live for the rest of the process.
//!
//! All mutation happens on the coordinator task; the fleet reads and updates
//! orchestration fields behind the same lock. Listener threads never touch
//! this type.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use crate::protocol::command::Command;
use crate::protocol::packet::{ModuleInfo, ModuleType, Tid};
use crate::{AcquisitionError, Result};

/// Registry key: one sensor on one port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub port: String,
    pub tid: Tid,
}

/// Amplifier gain selected by a MicroFlu reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gain {
    Low,
    High,
}

/// MicroFlu ROM configuration, from the `ReadCfg` reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MicroFluSettings {
    pub continuous: bool,
    pub auto_range: bool,
    pub low_gain: bool,
    pub averaging: u8,
}

impl MicroFluSettings {
    /// Decode the configuration payload: byte 0 carries the mode bits,
    /// byte 1 the averaging depth.
    pub fn from_config_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Err(AcquisitionError::protocol(
                "MicroFlu",
                format!("config payload too short: {} bytes", payload.len()),
            ));
        }
        Ok(Self {
            continuous: payload[0] & 0x01 != 0,
            auto_range: payload[0] & 0x02 != 0,
            low_gain: payload[0] & 0x04 != 0,
            averaging: payload[1],
        })
    }
}

/// SAM sampling settings, from the query-reply payload settings byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamSettings {
    pub auto_integration: bool,
    pub continuous: bool,
}

impl SamSettings {
    pub fn from_query_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 6 {
            return Err(AcquisitionError::protocol(
                "SAM",
                format!("query payload too short: {} bytes", payload.len()),
            ));
        }
        Ok(Self {
            auto_integration: payload[5] & 0x01 != 0,
            continuous: payload[5] & 0x02 != 0,
        })
    }
}

/// One calibrated MicroFlu reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MicroFluReading {
    pub gain: Gain,
    pub raw: u16,
    pub value: f32,
}

impl MicroFluReading {
    /// Decode a big-endian measurement word: top bit selects the gain
    /// (1 = low), the low 12 bits are the raw count.
    ///
    /// The scale factors (100x on low gain, 10x on high) look inverted
    /// relative to the usual amplifier convention but match the deployed
    /// calibration tables; do not "fix" them without hardware verification.
    pub fn from_word(word: u16) -> Self {
        let raw = word & 0x0FFF;
        if word & 0x8000 != 0 {
            Self { gain: Gain::Low, raw, value: 100.0 * f32::from(raw) / 2048.0 }
        } else {
            Self { gain: Gain::High, raw, value: 10.0 * f32::from(raw) / 2048.0 }
        }
    }
}

/// An assembled SAM spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub pixels: Vec<u16>,
    pub taken_at: SystemTime,
    pub integration_ms: u32,
}

/// Accumulates the 8 measurement frames a SAM splits a spectrum across.
#[derive(Debug, Default)]
pub struct SamAccumulator {
    slots: [Option<Vec<u16>>; 8],
}

/// Outcome of feeding one measurement frame to the accumulator.
#[derive(Debug, PartialEq)]
pub enum SlotOutcome {
    /// Frame stored; spectrum not complete yet.
    Stored,
    /// Framebyte 0 arrived with all slots filled: here is the spectrum.
    Complete(Vec<u16>),
    /// Framebyte outside 0..=7; not a spectral frame.
    Ignored,
}

impl SamAccumulator {
    /// Store a frame's words into its slot. Framebyte 0 closes the
    /// measurement: with every slot populated the spectrum is assembled,
    /// otherwise the partial data is discarded and an error reported. The
    /// slots are reset either way so stale frames never leak into the next
    /// cycle.
    pub fn store(&mut self, framebyte: u8, words: Vec<u16>) -> Result<SlotOutcome> {
        if framebyte > 7 {
            return Ok(SlotOutcome::Ignored);
        }
        self.slots[framebyte as usize] = Some(words);
        if framebyte != 0 {
            return Ok(SlotOutcome::Stored);
        }

        let missing = self.slots.iter().filter(|s| s.is_none()).count();
        if missing > 0 {
            self.reset();
            return Err(AcquisitionError::IncompleteSpectrum { tid: String::new(), missing });
        }

        // Frames arrive reverse-stored: reverse each slot, concatenate in
        // slot order, then reverse the whole sequence to restore one
        // ascending spectrum.
        let mut assembled = Vec::new();
        for slot in self.slots.iter_mut() {
            let mut words = slot.take().expect("all slots populated");
            words.reverse();
            assembled.extend(words);
        }
        assembled.reverse();
        Ok(SlotOutcome::Complete(assembled))
    }

    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Integration time in milliseconds encoded in a spectrum's first pixel.
pub fn integration_time_ms(spectrum: &[u16]) -> u32 {
    let code = spectrum.first().map_or(0, |px| px & 0xF);
    2 * (1u32 << code)
}

/// Measurement buffer, per module class.
#[derive(Debug)]
pub enum MeasurementBuffer {
    Sam(SamChannel),
    MicroFlu(MicroFluChannel),
    None,
}

#[derive(Debug, Default)]
pub struct SamChannel {
    pub accumulator: SamAccumulator,
    pub settings: SamSettings,
    pub spectrum: Option<Spectrum>,
}

#[derive(Debug, Default)]
pub struct MicroFluChannel {
    pub settings: MicroFluSettings,
    pub last: Option<MicroFluReading>,
    pub last_at: Option<SystemTime>,
}

/// The command most recently issued to a channel.
#[derive(Debug, Clone, Copy)]
pub struct IssuedCommand {
    pub label: &'static str,
    pub trigger: bool,
    pub at: Instant,
}

/// Everything known about one sensor on one port.
#[derive(Debug)]
pub struct ChannelState {
    pub module: ModuleInfo,
    pub verbosity: u8,
    pub last_command: Option<IssuedCommand>,
    /// Consecutive sampling cycles this sensor contributed nothing to.
    pub failures: u32,
    pub buffer: MeasurementBuffer,
    completed_at: Option<Instant>,
}

impl ChannelState {
    pub fn new(module: ModuleInfo, verbosity: u8) -> Self {
        let buffer = match module.module_type {
            ModuleType::Sam | ModuleType::SamIp => {
                MeasurementBuffer::Sam(SamChannel::default())
            }
            ModuleType::MicroFlu => MeasurementBuffer::MicroFlu(MicroFluChannel::default()),
            _ => MeasurementBuffer::None,
        };
        Self { module, verbosity, last_command: None, failures: 0, buffer, completed_at: None }
    }

    /// Record a command as issued now.
    pub fn record_command(&mut self, command: &Command) {
        self.last_command = Some(IssuedCommand {
            label: command.label(),
            trigger: command.is_measurement_trigger(),
            at: Instant::now(),
        });
    }

    /// Mark a measurement result as stored now.
    pub fn record_completion(&mut self) {
        self.completed_at = Some(Instant::now());
    }

    fn trigger_elapsed(&self, now: Instant) -> Option<Duration> {
        let cmd = self.last_command.as_ref()?;
        if !cmd.trigger {
            return None;
        }
        Some(now.saturating_duration_since(cmd.at))
    }

    /// A measurement is underway: the last command was a trigger, the
    /// class timeout has not elapsed, and no result has landed yet.
    pub fn is_pending(&self, now: Instant) -> bool {
        match self.trigger_elapsed(now) {
            Some(elapsed) => {
                elapsed < self.module.module_type.response_timeout() && !self.is_finished()
            }
            None => false,
        }
    }

    /// A result has been stored since the last trigger. Without a recorded
    /// result this is `false`, including after the timeout expires.
    pub fn is_finished(&self) -> bool {
        match (self.last_command.as_ref(), self.completed_at) {
            (Some(cmd), Some(done)) if cmd.trigger => done >= cmd.at,
            _ => false,
        }
    }
}

/// Shared per-sensor state map, keyed by port and TID.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelKey, ChannelState>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for a key (a fresh query reply always
    /// wins).
    pub fn insert(&mut self, key: ChannelKey, state: ChannelState) {
        self.channels.insert(key, state);
    }

    pub fn get(&self, key: &ChannelKey) -> Option<&ChannelState> {
        self.channels.get(key)
    }

    pub fn get_mut(&mut self, key: &ChannelKey) -> Option<&mut ChannelState> {
        self.channels.get_mut(key)
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChannelKey, &ChannelState)> {
        self.channels.iter()
    }

    /// Keys of every identified spectral sensor.
    pub fn spectral_keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = self
            .channels
            .iter()
            .filter(|(_, state)| state.module.module_type.is_spectral())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_by(|a, b| (&a.port, a.tid.to_string()).cmp(&(&b.port, b.tid.to_string())));
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{ModuleType, Tid};

    fn sam_info() -> ModuleInfo {
        ModuleInfo {
            tid: Tid::from_header(0x00, 0x04),
            address: 0x04,
            module_type: ModuleType::Sam,
            serial: 0x8042,
            firmware: 2.15,
            frequency_mhz: Some(8),
        }
    }

    fn microflu_info() -> ModuleInfo {
        ModuleInfo {
            tid: Tid::from_header(0x00, 0x08),
            address: 0x08,
            module_type: ModuleType::MicroFlu,
            serial: 0x1001,
            firmware: 1.0,
            frequency_mhz: None,
        }
    }

    #[test]
    fn sam_reassembly_reverses_slot_order() {
        let mut acc = SamAccumulator::default();
        // Slot i holds the single word i; deliver 7..=1 then close with 0.
        for fb in (1u8..=7).rev() {
            assert_eq!(acc.store(fb, vec![fb as u16]).unwrap(), SlotOutcome::Stored);
        }
        let outcome = acc.store(0, vec![0]).unwrap();
        let SlotOutcome::Complete(spectrum) = outcome else {
            panic!("expected complete spectrum, got {outcome:?}");
        };
        assert_eq!(spectrum, vec![7, 6, 5, 4, 3, 2, 1, 0]);
        assert_eq!(integration_time_ms(&spectrum), 256);
        assert_eq!(acc.filled(), 0);
    }

    #[test]
    fn sam_reassembly_multiword_slots() {
        let mut acc = SamAccumulator::default();
        // Slot i holds [10*i, 10*i + 1].
        for fb in (1u8..=7).rev() {
            let base = 10 * u16::from(fb);
            acc.store(fb, vec![base, base + 1]).unwrap();
        }
        let outcome = acc.store(0, vec![0, 1]).unwrap();
        let SlotOutcome::Complete(spectrum) = outcome else {
            panic!("expected complete spectrum");
        };
        // Slot 7 first, each slot in original word order.
        assert_eq!(&spectrum[..4], &[70, 71, 60, 61]);
        assert_eq!(&spectrum[14..], &[0, 1]);
    }

    #[test]
    fn incomplete_spectrum_discards_and_resets() {
        let mut acc = SamAccumulator::default();
        acc.store(3, vec![3]).unwrap();
        acc.store(5, vec![5]).unwrap();

        let err = acc.store(0, vec![0]).unwrap_err();
        assert!(matches!(err, AcquisitionError::IncompleteSpectrum { missing: 5, .. }));
        assert_eq!(acc.filled(), 0, "partial data must not survive the reset");
    }

    #[test]
    fn non_spectral_framebytes_are_ignored() {
        let mut acc = SamAccumulator::default();
        assert_eq!(acc.store(8, vec![1]).unwrap(), SlotOutcome::Ignored);
        assert_eq!(acc.store(200, vec![1]).unwrap(), SlotOutcome::Ignored);
        assert_eq!(acc.filled(), 0);
    }

    #[test]
    fn microflu_word_decode_matches_calibration() {
        let r = MicroFluReading::from_word(0x8123);
        assert_eq!(r.gain, Gain::Low);
        assert_eq!(r.raw, 0x123);
        assert!((r.value - 100.0 * 291.0 / 2048.0).abs() < 1e-4);
        assert!((r.value - 14.21).abs() < 0.01);

        let r = MicroFluReading::from_word(0x0123);
        assert_eq!(r.gain, Gain::High);
        assert_eq!(r.raw, 291);
        assert!((r.value - 1.42).abs() < 0.01);
    }

    #[test]
    fn microflu_settings_decode() {
        let s = MicroFluSettings::from_config_payload(&[0b0000_0101, 4]).unwrap();
        assert!(s.continuous);
        assert!(!s.auto_range);
        assert!(s.low_gain);
        assert_eq!(s.averaging, 4);

        assert!(MicroFluSettings::from_config_payload(&[1]).is_err());
    }

    #[test]
    fn pending_and_finished_are_timeout_bounded() {
        let mut state = ChannelState::new(sam_info(), 0);
        let trigger = Command::Sam(crate::protocol::command::SamCommand::StartIntAuto);

        // No command yet: neither pending nor finished.
        let now = Instant::now();
        assert!(!state.is_pending(now));
        assert!(!state.is_finished());

        state.record_command(&trigger);
        assert!(state.is_pending(Instant::now()));
        assert!(!state.is_finished());

        // Past the 12 s SAM timeout with no result: both false.
        let late = Instant::now() + Duration::from_secs(13);
        assert!(!state.is_pending(late));
        assert!(!state.is_finished());

        // A stored result finishes the measurement and clears pending.
        state.record_command(&trigger);
        state.record_completion();
        assert!(state.is_finished());
        assert!(!state.is_pending(Instant::now()));
    }

    #[test]
    fn non_trigger_commands_never_pend() {
        let mut state = ChannelState::new(sam_info(), 0);
        state.record_command(&Command::Sam(crate::protocol::command::SamCommand::Sleep));
        assert!(!state.is_pending(Instant::now()));
    }

    #[test]
    fn microflu_uses_the_short_timeout() {
        let mut state = ChannelState::new(microflu_info(), 0);
        state.record_command(&Command::MicroFlu(
            crate::protocol::command::MicroFluCommand::Start,
        ));
        assert!(state.is_pending(Instant::now()));
        assert!(!state.is_pending(Instant::now() + Duration::from_secs(6)));
    }

    #[test]
    fn spectral_keys_filters_and_orders() {
        let mut reg = ChannelRegistry::new();
        reg.insert(
            ChannelKey { port: "ttyB".into(), tid: sam_info().tid },
            ChannelState::new(sam_info(), 0),
        );
        reg.insert(
            ChannelKey { port: "ttyA".into(), tid: microflu_info().tid },
            ChannelState::new(microflu_info(), 0),
        );
        let mut samip = sam_info();
        samip.module_type = ModuleType::SamIp;
        samip.tid = Tid::from_header(0x00, 0x06);
        reg.insert(
            ChannelKey { port: "ttyA".into(), tid: samip.tid },
            ChannelState::new(samip, 0),
        );

        let keys = reg.spectral_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].port, "ttyA");
        assert_eq!(keys[1].port, "ttyB");
    }
}
