//! Telemetry acquisition for shipborne hyperspectral radiometer fleets.
//!
//! Crowsnest talks to TriOS-style radiometers over serial lines: it frames
//! and decodes their binary protocol, keeps per-sensor state, runs one
//! listener per port, and orchestrates synchronized measurements with
//! automatic recovery (reconnect, then hardware power cycle) when sensors
//! go missing.
//!
//! # Architecture
//!
//! - **Listeners**: one OS thread per serial port pumps bytes through the
//!   framer and decoder and forwards packets over a queue.
//! - **Coordinator**: a single task owns all per-sensor state mutation and
//!   issues protocol follow-ups, so concurrent spectrum-slot updates cannot
//!   race.
//! - **Fleet**: [`FleetManager`] drives connect/identify, sampling cycles,
//!   and failure recovery from the caller's task.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use crowsnest::{FleetConfig, FleetManager};
//!
//! #[tokio::main]
//! async fn main() -> crowsnest::Result<()> {
//!     let config = FleetConfig::new(vec!["/dev/ttyS3".into(), "/dev/ttyS4".into()]);
//!     let mut fleet = FleetManager::new(config);
//!
//!     fleet.connect().await?;
//!     let batch = fleet.sample_all(None).await?;
//!     for reading in &batch.readings {
//!         println!(
//!             "sensor {}: {} px @ {} ms integration",
//!             reading.serial,
//!             reading.pixels.len(),
//!             reading.integration_ms
//!         );
//!     }
//!
//!     fleet.stop();
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
#[cfg(test)]
pub mod test_utils;

// Wire protocol
pub mod protocol;

// Acquisition pipeline
pub mod dispatch;
pub mod listener;
pub mod registry;

// Fleet orchestration and collaborators
pub mod fleet;
pub mod power;
pub mod serial;

// Core exports
pub use config::FleetConfig;
pub use error::{AcquisitionError, Result};

// Pipeline exports
pub use dispatch::SpectrumEvent;
pub use listener::{ListenerState, PortListener, RoutedPacket};
pub use protocol::command::{Command, GenericCommand, MicroFluCommand, SamCommand};
pub use protocol::framer::BlockFramer;
pub use protocol::packet::{ModuleInfo, ModuleType, Packet, PacketKind, Tid};
pub use registry::{
    ChannelKey, ChannelRegistry, ChannelState, Gain, MicroFluReading, MicroFluSettings,
    SamSettings, Spectrum,
};

// Fleet exports
pub use fleet::{FleetManager, SampleBatch, SpectrumReading};
pub use power::{NoPower, PowerSwitch};
pub use serial::{LinkFactory, PortHandle, SerialLink, SerialportFactory};
