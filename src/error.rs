//! Error types for radiometer telemetry acquisition.
//!
//! All errors implement the `std::error::Error` trait and carry structured
//! context. The taxonomy follows the acquisition pipeline: framing and decode
//! errors are stream-level and always survivable, protocol and reassembly
//! errors are per-packet, and fleet-level errors (`NoSensorsFound`, `Halted`)
//! end the current acquisition cycle.
//!
//! ## Recovery
//!
//! Errors classify themselves:
//!
//! ```rust
//! use crowsnest::AcquisitionError;
//!
//! let error = AcquisitionError::framing("size code 7 encodes 256 payload bytes");
//! assert!(error.is_recoverable());
//!
//! let error = AcquisitionError::NoSensorsFound;
//! assert!(!error.is_recoverable());
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for acquisition operations.
pub type Result<T, E = AcquisitionError> = std::result::Result<T, E>;

/// Main error type for telemetry acquisition.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AcquisitionError {
    #[error("Framing error: {reason}")]
    Framing { reason: String },

    #[error("Decode error: block is {actual} bytes, expected {expected}")]
    Decode { expected: usize, actual: usize },

    #[error("Protocol error from sensor {tid}: {detail}")]
    Protocol { tid: String, detail: String },

    #[error("Incomplete spectrum on {tid}: {missing} of 8 frame slots empty")]
    IncompleteSpectrum { tid: String, missing: usize },

    #[error("Measurement for unregistered channel {tid} on port {port} (open: {port_open})")]
    UnregisteredChannel { port: String, tid: String, port_open: bool },

    #[error("Sensor {serial} missed {consecutive} consecutive measurements")]
    SensorMissing { serial: u16, consecutive: u32 },

    #[error("No spectral sensors found after identification")]
    NoSensorsFound,

    #[error("Invalid command: {detail}")]
    Command { detail: String },

    #[error("Serial port error on {port}")]
    Serial {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config error: {path}")]
    Config {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Fleet is busy with an active sampling cycle")]
    Busy,

    #[error("Acquisition halted: {reason}")]
    Halted { reason: String },
}

impl AcquisitionError {
    /// Returns whether the acquisition stream can continue past this error.
    ///
    /// Recoverable errors are logged and dropped by the listener/coordinator
    /// loops; unrecoverable ones end the current fleet cycle and require a
    /// `connect()` (or a power cycle) to clear.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AcquisitionError::Framing { .. } => true,
            AcquisitionError::Decode { .. } => true,
            AcquisitionError::Protocol { .. } => true,
            AcquisitionError::IncompleteSpectrum { .. } => true,
            AcquisitionError::UnregisteredChannel { port_open, .. } => *port_open,
            AcquisitionError::SensorMissing { .. } => true,
            AcquisitionError::Serial { .. } => true,
            AcquisitionError::Busy => true,
            AcquisitionError::NoSensorsFound => false,
            AcquisitionError::Command { .. } => false,
            AcquisitionError::Config { .. } => false,
            AcquisitionError::Halted { .. } => false,
        }
    }

    /// Helper constructor for framing errors.
    pub fn framing(reason: impl Into<String>) -> Self {
        AcquisitionError::Framing { reason: reason.into() }
    }

    /// Helper constructor for sensor-reported protocol errors.
    pub fn protocol(tid: impl Into<String>, detail: impl Into<String>) -> Self {
        AcquisitionError::Protocol { tid: tid.into(), detail: detail.into() }
    }

    /// Helper constructor for command construction errors.
    pub fn command(detail: impl Into<String>) -> Self {
        AcquisitionError::Command { detail: detail.into() }
    }

    /// Helper constructor for serial I/O errors with port context.
    pub fn serial(port: impl Into<String>, source: std::io::Error) -> Self {
        AcquisitionError::Serial { port: port.into(), source }
    }

    /// Helper constructor for config load errors.
    pub fn config(path: PathBuf, source: Box<dyn std::error::Error + Send + Sync>) -> Self {
        AcquisitionError::Config { path, source }
    }

    /// Helper constructor for a halted acquisition pipeline.
    pub fn halted(reason: impl Into<String>) -> Self {
        AcquisitionError::Halted { reason: reason.into() }
    }
}
