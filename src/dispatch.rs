//! Packet dispatch coordinator.
//!
//! Every listener forwards its decoded packets to one coordinator task,
//! which is the only writer of per-sensor state. Routing a spectrum frame,
//! identifying a module, and issuing follow-up commands all happen here, in
//! arrival order, so concurrent slot updates cannot race.
//!
//! The coordinator survives every recoverable error. The one fatal case is
//! a measurement for an unregistered channel whose port has already closed:
//! that is protocol desynchronization beyond self-repair, so the coordinator
//! records the error and halts until the fleet reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::FleetConfig;
use crate::listener::RoutedPacket;
use crate::protocol::command::{Command, GenericCommand, MicroFluCommand};
use crate::protocol::packet::{ModuleType, PacketKind};
use crate::registry::{
    ChannelKey, ChannelRegistry, ChannelState, MeasurementBuffer, MicroFluReading,
    MicroFluSettings, SamSettings, SlotOutcome, Spectrum, integration_time_ms,
};
use crate::serial::PortHandle;
use crate::{AcquisitionError, Result};

/// Sub-channel addresses behind an IPS hub module.
pub const IPS_SUBCHANNELS: [u8; 4] = [0x02, 0x04, 0x06, 0x08];

/// A completed spectrum, published to subscribers as it is assembled.
#[derive(Debug, Clone)]
pub struct SpectrumEvent {
    pub key: ChannelKey,
    pub serial: u16,
    pub spectrum: Spectrum,
}

/// Latest-spectrum publication channel payload.
pub(crate) type SpectrumWatch = watch::Sender<Option<Arc<SpectrumEvent>>>;

/// Shared slot for the coordinator's fatal error, read by the fleet.
pub(crate) type FatalSlot = Arc<Mutex<Option<AcquisitionError>>>;

/// Spawn the coordinator task for one fleet cycle.
///
/// The task ends when cancelled, when every listener sender is gone, or on
/// a fatal dispatch error.
pub(crate) fn spawn_coordinator(
    rx: mpsc::UnboundedReceiver<RoutedPacket>,
    registry: Arc<Mutex<ChannelRegistry>>,
    ports: HashMap<String, PortHandle>,
    config: Arc<FleetConfig>,
    fatal: FatalSlot,
    spectra: Arc<SpectrumWatch>,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        dispatch_loop(rx, registry, ports, config, fatal, spectra, task_cancel).await;
    });
    cancel
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<RoutedPacket>,
    registry: Arc<Mutex<ChannelRegistry>>,
    ports: HashMap<String, PortHandle>,
    config: Arc<FleetConfig>,
    fatal: FatalSlot,
    spectra: Arc<SpectrumWatch>,
    cancel: CancellationToken,
) {
    info!("coordinator started");
    let mut packet_count = 0u64;

    loop {
        let routed = tokio::select! {
            _ = cancel.cancelled() => {
                info!("coordinator cancelled");
                break;
            }
            msg = rx.recv() => match msg {
                Some(routed) => routed,
                None => {
                    debug!("all listeners gone, coordinator exiting");
                    break;
                }
            },
        };
        packet_count += 1;

        if let Err(e) = handle_packet(&routed, &registry, &ports, &config, &spectra) {
            if e.is_recoverable() {
                warn!(port = %routed.port, error = %e, "packet dropped");
            } else {
                error!(port = %routed.port, error = %e, "fatal dispatch error, halting");
                *fatal.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
                break;
            }
        }
    }

    info!("coordinator stopped ({packet_count} packets dispatched)");
}

/// Dispatch one packet. Errors bubble up for the loop to classify.
pub(crate) fn handle_packet(
    routed: &RoutedPacket,
    registry: &Arc<Mutex<ChannelRegistry>>,
    ports: &HashMap<String, PortHandle>,
    config: &FleetConfig,
    spectra: &SpectrumWatch,
) -> Result<()> {
    let packet = &routed.packet;
    let key = ChannelKey { port: routed.port.clone(), tid: packet.tid };

    match packet.kind() {
        PacketKind::Error => {
            // Sensor-reported protocol error, usually a malformed prior
            // command. Log and drop.
            Err(AcquisitionError::protocol(key.tid.to_string(), "sensor reported error frame"))
        }
        PacketKind::Query => handle_query(&key, routed, registry, ports, config),
        PacketKind::MfConfig => handle_mf_config(&key, routed, registry, ports),
        PacketKind::Measurement => handle_measurement(&key, routed, registry, ports, spectra),
    }
}

fn handle_query(
    key: &ChannelKey,
    routed: &RoutedPacket,
    registry: &Arc<Mutex<ChannelRegistry>>,
    ports: &HashMap<String, PortHandle>,
    config: &FleetConfig,
) -> Result<()> {
    let packet = &routed.packet;
    let info = packet.query_info()?;
    let mut state = ChannelState::new(info, config.verbosity);

    if matches!(info.module_type, ModuleType::Sam | ModuleType::SamIp) {
        match SamSettings::from_query_payload(&packet.payload) {
            Ok(settings) => {
                if let MeasurementBuffer::Sam(ch) = &mut state.buffer {
                    ch.settings = settings;
                }
            }
            Err(e) => warn!(tid = %key.tid, error = %e, "query reply without SAM settings"),
        }
    }

    info!(
        port = %key.port,
        tid = %key.tid,
        module = ?info.module_type,
        serial = info.serial,
        firmware = %info.firmware,
        "module identified"
    );
    lock(registry).insert(key.clone(), state);

    let Some(handle) = ports.get(&routed.port) else {
        warn!(port = %key.port, "query reply on unknown port, skipping follow-ups");
        return Ok(());
    };

    match info.module_type {
        ModuleType::Ips => {
            // Hub fan-out: identify each sub-channel behind it.
            for addr in IPS_SUBCHANNELS {
                handle.write(&Command::Generic(GenericCommand::Query).encode(addr))?;
            }
        }
        ModuleType::MicroFlu => {
            // The query disturbs the sensor's sampling mode; fetch the ROM
            // config so the MfConfig reply can restore it.
            let readcfg = Command::MicroFlu(MicroFluCommand::ReadCfg);
            handle.write(&readcfg.encode(key.tid.address()))?;
            if let Some(state) = lock(registry).get_mut(key) {
                state.record_command(&readcfg);
            }
        }
        _ => {}
    }
    Ok(())
}

fn handle_mf_config(
    key: &ChannelKey,
    routed: &RoutedPacket,
    registry: &Arc<Mutex<ChannelRegistry>>,
    ports: &HashMap<String, PortHandle>,
) -> Result<()> {
    let settings = MicroFluSettings::from_config_payload(&routed.packet.payload)?;

    let restore = {
        let mut reg = lock(registry);
        let Some(state) = reg.get_mut(key) else {
            debug!(tid = %key.tid, "config reply for unknown channel, ignoring");
            return Ok(());
        };
        let MeasurementBuffer::MicroFlu(ch) = &mut state.buffer else {
            debug!(tid = %key.tid, "config reply for non-MicroFlu channel, ignoring");
            return Ok(());
        };
        ch.settings = settings;

        // Restore the sampling mode the query interrupted.
        let restore = if settings.continuous {
            Command::MicroFlu(MicroFluCommand::ContOn)
        } else {
            Command::MicroFlu(MicroFluCommand::ContOff)
        };
        state.record_command(&restore);
        restore
    };

    debug!(tid = %key.tid, ?settings, "MicroFlu configuration stored");
    if let Some(handle) = ports.get(&routed.port) {
        handle.write(&restore.encode(key.tid.address()))?;
    }
    Ok(())
}

fn handle_measurement(
    key: &ChannelKey,
    routed: &RoutedPacket,
    registry: &Arc<Mutex<ChannelRegistry>>,
    ports: &HashMap<String, PortHandle>,
    spectra: &SpectrumWatch,
) -> Result<()> {
    let packet = &routed.packet;
    let mut reg = lock(registry);

    let Some(state) = reg.get_mut(key) else {
        let port_open = ports.get(&routed.port).is_some_and(PortHandle::is_open);
        return Err(AcquisitionError::UnregisteredChannel {
            port: key.port.clone(),
            tid: key.tid.to_string(),
            port_open,
        });
    };

    let mut completed = false;
    let mut assembled: Option<Spectrum> = None;

    match &mut state.buffer {
        MeasurementBuffer::Sam(ch) => {
            let words: Vec<u16> = packet
                .payload
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            match ch.accumulator.store(packet.framebyte, words) {
                Ok(SlotOutcome::Complete(pixels)) => {
                    let spectrum = Spectrum {
                        integration_ms: integration_time_ms(&pixels),
                        pixels,
                        taken_at: SystemTime::now(),
                    };
                    ch.spectrum = Some(spectrum.clone());
                    assembled = Some(spectrum);
                    completed = true;
                }
                Ok(SlotOutcome::Stored) => {
                    trace!(tid = %key.tid, framebyte = packet.framebyte, "frame stored");
                }
                Ok(SlotOutcome::Ignored) => {
                    trace!(tid = %key.tid, framebyte = packet.framebyte, "non-spectral frame");
                }
                Err(AcquisitionError::IncompleteSpectrum { missing, .. }) => {
                    return Err(AcquisitionError::IncompleteSpectrum {
                        tid: key.tid.to_string(),
                        missing,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        MeasurementBuffer::MicroFlu(ch) => {
            if packet.payload.len() < 2 {
                return Err(AcquisitionError::protocol(
                    key.tid.to_string(),
                    "MicroFlu measurement payload shorter than one word",
                ));
            }
            let word = u16::from_be_bytes([packet.payload[0], packet.payload[1]]);
            let reading = MicroFluReading::from_word(word);
            trace!(tid = %key.tid, ?reading, "MicroFlu reading");
            ch.last = Some(reading);
            ch.last_at = Some(SystemTime::now());
            completed = true;
        }
        MeasurementBuffer::None => {
            debug!(tid = %key.tid, module = ?state.module.module_type, "measurement ignored");
        }
    }

    if completed {
        state.record_completion();
    }
    if let Some(spectrum) = assembled {
        let event =
            SpectrumEvent { key: key.clone(), serial: state.module.serial, spectrum };
        debug!(
            tid = %key.tid,
            serial = event.serial,
            pixels = event.spectrum.pixels.len(),
            integration_ms = event.spectrum.integration_ms,
            "spectrum assembled"
        );
        let _ = spectra.send(Some(Arc::new(event)));
    }
    Ok(())
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
