//! Fleet orchestration.
//!
//! A [`FleetManager`] owns the serial ports, one listener thread per port,
//! the shared channel registry, and the coordinator task. It drives the
//! connect/identify cycle, triggers synchronized measurements across the
//! spectral sensors, and escalates recovery from reconnect to hardware
//! power cycle when sensors go missing.
//!
//! Orchestration runs on the caller's task and blocks it for up to the
//! per-sensor-class timeout while sampling; there is no cancellation
//! mid-sample other than that timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::dispatch::{FatalSlot, SpectrumEvent, lock, spawn_coordinator};
use crate::listener::PortListener;
use crate::power::{NoPower, PowerSwitch};
use crate::protocol::BROADCAST_ADDRESS;
use crate::protocol::command::{Command, GenericCommand, SamCommand, integration_code};
use crate::registry::{ChannelKey, ChannelRegistry, MeasurementBuffer};
use crate::serial::{LinkFactory, PortHandle, SerialportFactory};
use crate::{AcquisitionError, Result};

/// Registry poll interval while waiting for triggered measurements.
const SAMPLE_POLL: Duration = Duration::from_millis(100);

/// One sensor's contribution to a sampling cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumReading {
    pub serial: u16,
    pub integration_ms: u32,
    pub pixels: Vec<u16>,
}

/// Result of one synchronized sampling cycle.
///
/// `readings` holds finished sensors only; a sensor that timed out appears
/// in `missing` and contributes nothing. Size any downstream storage by
/// `readings`, never by the subset that was requested.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub trigger_id: u64,
    pub triggered_at: SystemTime,
    pub readings: Vec<SpectrumReading>,
    /// Serial numbers that produced no spectrum before their timeout.
    pub missing: Vec<u16>,
    /// True once any failure counter exceeds the configured allowance.
    pub needs_recovery: bool,
}

struct PortRuntime {
    handle: PortHandle,
    listener: PortListener,
}

/// Owns and orchestrates a radiometer fleet.
pub struct FleetManager {
    config: Arc<FleetConfig>,
    factory: Box<dyn LinkFactory>,
    power: Box<dyn PowerSwitch>,
    registry: Arc<Mutex<ChannelRegistry>>,
    ports: HashMap<String, PortRuntime>,
    sensors: Vec<ChannelKey>,
    expected: usize,
    cancel: Option<CancellationToken>,
    fatal: FatalSlot,
    spectra_tx: Arc<watch::Sender<Option<Arc<SpectrumEvent>>>>,
    spectra_rx: watch::Receiver<Option<Arc<SpectrumEvent>>>,
    busy: bool,
    last_reboot: Option<Instant>,
    reboot_count: u32,
    trigger_seq: u64,
}

impl FleetManager {
    /// Create a fleet manager using real serial ports and no power control.
    pub fn new(config: FleetConfig) -> Self {
        Self::with_collaborators(config, Box::new(SerialportFactory), Box::new(NoPower))
    }

    /// Create a fleet manager with explicit collaborators (tests inject
    /// scripted links and counting power switches here).
    pub fn with_collaborators(
        config: FleetConfig,
        factory: Box<dyn LinkFactory>,
        power: Box<dyn PowerSwitch>,
    ) -> Self {
        let (spectra_tx, spectra_rx) = watch::channel(None);
        Self {
            config: Arc::new(config),
            factory,
            power,
            registry: Arc::new(Mutex::new(ChannelRegistry::new())),
            ports: HashMap::new(),
            sensors: Vec::new(),
            expected: 0,
            cancel: None,
            fatal: Arc::new(Mutex::new(None)),
            spectra_tx: Arc::new(spectra_tx),
            spectra_rx,
            busy: false,
            last_reboot: None,
            reboot_count: 0,
            trigger_seq: 0,
        }
    }

    /// Keys of the spectral sensors identified by the last `connect()`.
    pub fn sensors(&self) -> &[ChannelKey] {
        &self.sensors
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn reboot_count(&self) -> u32 {
        self.reboot_count
    }

    /// Stream of completed spectra, latest-wins. Subscribers that fall
    /// behind see only the most recent spectrum. The stream does not borrow
    /// the fleet; it stays live across sampling calls.
    pub fn spectra(&self) -> impl Stream<Item = Arc<SpectrumEvent>> + Send + use<> {
        WatchStream::new(self.spectra_rx.clone()).filter_map(|opt| async move { opt })
    }

    /// (Re)connect the whole fleet: close everything, reopen every
    /// configured port with a fresh listener and coordinator, identify the
    /// modules, and collect the spectral sensors.
    ///
    /// Fails with [`NoSensorsFound`](AcquisitionError::NoSensorsFound) —
    /// leaving every port closed — when identification yields no SAM/SAMIP
    /// module. Partial fleets are for the caller to judge via the returned
    /// count; zero is never silently accepted.
    pub async fn connect(&mut self) -> Result<usize> {
        info!(ports = ?self.config.ports, "connecting fleet");
        self.teardown();
        lock(&self.registry).clear();
        *lock(&self.fatal) = None;
        self.sensors.clear();
        tokio::time::sleep(Duration::from_millis(self.config.settle_ms)).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut handles = HashMap::new();
        for port in &self.config.ports {
            let link = match self.factory.open(port, &self.config) {
                Ok(link) => link,
                Err(e) => {
                    warn!(port = %port, error = %e, "failed to open port");
                    self.teardown();
                    return Err(e);
                }
            };
            let handle = PortHandle::new(port, link);
            handles.insert(port.clone(), handle.clone());
            let listener = PortListener::spawn(handle.clone(), tx.clone());
            self.ports.insert(port.clone(), PortRuntime { handle, listener });
        }
        drop(tx);

        self.cancel = Some(spawn_coordinator(
            rx,
            Arc::clone(&self.registry),
            handles,
            Arc::clone(&self.config),
            Arc::clone(&self.fatal),
            Arc::clone(&self.spectra_tx),
        ));

        tokio::time::sleep(Duration::from_millis(self.config.warmup_ms)).await;
        debug!(verbosity = self.config.verbosity, "applying port verbosity");

        // Identify everything on every port.
        let query = Command::Generic(GenericCommand::Query).encode(BROADCAST_ADDRESS);
        for runtime in self.ports.values() {
            if let Err(e) = runtime.handle.write(&query) {
                self.teardown();
                return Err(e);
            }
        }
        tokio::time::sleep(Duration::from_millis(self.config.reply_window_ms)).await;

        self.sensors = lock(&self.registry).spectral_keys();
        if self.sensors.is_empty() {
            warn!("no spectral sensors identified, closing fleet");
            self.teardown();
            return Err(AcquisitionError::NoSensorsFound);
        }

        self.expected = if self.config.expected_sensors > 0 {
            self.config.expected_sensors
        } else {
            self.sensors.len()
        };
        info!(sensors = self.sensors.len(), expected = self.expected, "fleet ready");
        Ok(self.sensors.len())
    }

    /// Trigger a synchronized measurement on the selected sensors (all
    /// spectral sensors when `subset` is `None`) and wait for the results.
    ///
    /// Blocks the calling task until no selected sensor is still pending,
    /// bounded by the per-class response timeout. Finished sensors reset
    /// their failure counter; missing sensors increment it.
    pub async fn sample_all(&mut self, subset: Option<&[ChannelKey]>) -> Result<SampleBatch> {
        if let Some(fatal) = lock(&self.fatal).take() {
            return Err(fatal);
        }
        if self.busy {
            return Err(AcquisitionError::Busy);
        }
        if self.sensors.is_empty() {
            return Err(AcquisitionError::NoSensorsFound);
        }

        let selected: Vec<ChannelKey> = match subset {
            Some(keys) => self.sensors.iter().filter(|k| keys.contains(k)).cloned().collect(),
            None => self.sensors.clone(),
        };

        self.busy = true;
        let result = self.run_sampling(&selected).await;
        self.busy = false;
        result
    }

    async fn run_sampling(&mut self, selected: &[ChannelKey]) -> Result<SampleBatch> {
        self.trigger_seq += 1;
        let trigger_id = self.trigger_seq;
        let triggered_at = SystemTime::now();

        let command = if self.config.integration_time_ms > 0 {
            match integration_code(self.config.integration_time_ms) {
                Some(code) => Command::Sam(SamCommand::StartIntSet(code)),
                None => {
                    warn!(
                        integration_time_ms = self.config.integration_time_ms,
                        "integration time not expressible, falling back to auto"
                    );
                    Command::Sam(SamCommand::StartIntAuto)
                }
            }
        } else {
            Command::Sam(SamCommand::StartIntAuto)
        };

        info!(trigger_id, sensors = selected.len(), command = command.label(), "sampling");
        {
            let mut reg = lock(&self.registry);
            for key in selected {
                let Some(state) = reg.get_mut(key) else {
                    continue;
                };
                state.record_command(&command);
                if let Some(runtime) = self.ports.get(&key.port) {
                    if let Err(e) = runtime.handle.write(&command.encode(key.tid.address())) {
                        warn!(port = %key.port, tid = %key.tid, error = %e, "trigger write failed");
                    }
                }
            }
        }

        // Busy-poll the registry until every selected sensor either finished
        // or timed out.
        loop {
            tokio::time::sleep(SAMPLE_POLL).await;
            let now = Instant::now();
            let still_pending = {
                let reg = lock(&self.registry);
                selected.iter().any(|key| reg.get(key).is_some_and(|s| s.is_pending(now)))
            };
            if !still_pending {
                break;
            }
        }

        let mut readings = Vec::new();
        let mut missing = Vec::new();
        let mut needs_recovery = false;
        {
            let mut reg = lock(&self.registry);
            for key in selected {
                let Some(state) = reg.get_mut(key) else {
                    continue;
                };
                if state.is_finished() {
                    state.failures = 0;
                    if let MeasurementBuffer::Sam(ch) = &state.buffer {
                        if let Some(spectrum) = &ch.spectrum {
                            readings.push(SpectrumReading {
                                serial: state.module.serial,
                                integration_ms: spectrum.integration_ms,
                                pixels: spectrum.pixels.clone(),
                            });
                        }
                    }
                } else {
                    state.failures += 1;
                    let err = AcquisitionError::SensorMissing {
                        serial: state.module.serial,
                        consecutive: state.failures,
                    };
                    warn!(tid = %key.tid, error = %err, "sensor missing from cycle");
                    missing.push(state.module.serial);
                    if state.failures > self.config.allowed_timeouts {
                        needs_recovery = true;
                    }
                }
            }
        }

        info!(trigger_id, finished = readings.len(), missing = missing.len(), "cycle complete");
        Ok(SampleBatch { trigger_id, triggered_at, readings, missing, needs_recovery })
    }

    /// Verify the live sensor count against the expected count and recover
    /// if short: a reconnect when the last power cycle is recent, a full
    /// power cycle otherwise. Returns whether the expected count is met
    /// afterwards.
    ///
    /// Repeated failing calls inside the minimum reboot interval never
    /// power-cycle twice; that hold-off is what prevents reboot storms.
    pub async fn check_and_restore_sensor_number(&mut self) -> Result<bool> {
        if self.expected == 0 {
            // No baseline yet; nothing to restore.
            return Ok(true);
        }
        let live = self.live_sensor_count();
        if live == self.expected {
            return Ok(true);
        }
        warn!(live, expected = self.expected, "sensor count short, recovering");

        let within_holdoff = self
            .last_reboot
            .is_some_and(|at| at.elapsed() < self.config.min_reboot_interval());
        let attempt = if within_holdoff {
            info!("inside reboot hold-off, reconnect-only recovery");
            self.connect().await.map(|_| ())
        } else {
            self.power_cycle_sensors().await
        };
        if let Err(e) = attempt {
            warn!(error = %e, "recovery attempt failed");
            return Ok(false);
        }
        Ok(self.live_sensor_count() == self.expected)
    }

    /// Cut sensor power, wait, restore it, wait for boot, and reconnect.
    pub async fn power_cycle_sensors(&mut self) -> Result<()> {
        info!(pins = ?self.config.power_pins, reboots = self.reboot_count, "power cycling sensors");
        for &pin in &self.config.power_pins {
            self.power.set(pin, false)?;
        }
        tokio::time::sleep(Duration::from_millis(self.config.power_off_ms)).await;
        for &pin in &self.config.power_pins {
            self.power.set(pin, true)?;
        }
        tokio::time::sleep(Duration::from_millis(self.config.power_boot_ms)).await;

        // Bookkeeping happens at power-up, not after the reconnect, so the
        // hold-off window covers a reconnect that fails.
        self.reboot_count += 1;
        self.last_reboot = Some(Instant::now());

        self.connect().await?;
        Ok(())
    }

    /// Stop the fleet: cancel the coordinator, stop every listener (bounded
    /// join), and close every port.
    pub fn stop(&mut self) {
        info!("stopping fleet");
        self.teardown();
        self.sensors.clear();
    }

    fn live_sensor_count(&self) -> usize {
        let reg = lock(&self.registry);
        self.sensors
            .iter()
            .filter(|key| {
                reg.get(key).is_some_and(|s| s.failures <= self.config.allowed_timeouts)
            })
            .count()
    }

    fn teardown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        for (_, mut runtime) in self.ports.drain() {
            runtime.listener.stop();
            runtime.handle.close();
        }
    }
}

impl Drop for FleetManager {
    fn drop(&mut self) {
        debug!("dropping fleet manager");
        self.teardown();
    }
}
