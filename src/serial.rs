//! Serial link abstraction.
//!
//! Radiometers hang off RS-232/RS-485 lines; everything above this module
//! only needs three operations: poll for available bytes, write, flush. The
//! [`LinkFactory`] seam lets tests substitute scripted links for real ports.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{AcquisitionError, FleetConfig, Result};

/// Poll timeout for the non-blocking read: long enough to batch bytes,
/// short enough that listener pacing dominates the loop.
const READ_POLL: Duration = Duration::from_millis(10);

/// A bidirectional byte link to one serial port.
pub trait SerialLink: Send {
    /// Read whatever is available, returning `Ok(0)` when nothing arrived
    /// within the poll window. Never blocks longer than the poll window.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Opens serial links for the fleet.
pub trait LinkFactory: Send + Sync {
    fn open(&self, port: &str, config: &FleetConfig) -> Result<Box<dyn SerialLink>>;
}

/// Production factory backed by the `serialport` crate: 8N1, no flow
/// control, short read timeout.
#[derive(Debug, Default)]
pub struct SerialportFactory;

impl LinkFactory for SerialportFactory {
    fn open(&self, port: &str, config: &FleetConfig) -> Result<Box<dyn SerialLink>> {
        let link = serialport::new(port, config.baud)
            .timeout(READ_POLL)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| AcquisitionError::serial(port, io::Error::other(e)))?;
        Ok(Box::new(SerialportLink { inner: link }))
    }
}

struct SerialportLink {
    inner: Box<dyn serialport::SerialPort>,
}

impl SerialLink for SerialportLink {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match io::Read::read(&mut self.inner, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.inner, bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.inner)
    }
}

/// Cloneable handle to one open port, shared by its listener thread, the
/// coordinator (follow-up commands), and the fleet (triggers, broadcasts).
/// Access to the underlying link is serialized.
#[derive(Clone)]
pub struct PortHandle {
    name: Arc<str>,
    link: Arc<Mutex<Box<dyn SerialLink>>>,
    open: Arc<AtomicBool>,
}

impl PortHandle {
    pub fn new(name: &str, link: Box<dyn SerialLink>) -> Self {
        Self {
            name: Arc::from(name),
            link: Arc::new(Mutex::new(link)),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark the port closed. The device itself is released when the last
    /// handle drops.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Write a command frame and flush it out.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(AcquisitionError::serial(
                self.name(),
                io::Error::new(io::ErrorKind::NotConnected, "port is closed"),
            ));
        }
        let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        link.write_all(bytes)
            .and_then(|()| link.flush())
            .map_err(|e| AcquisitionError::serial(self.name(), e))
    }

    /// Poll the link for inbound bytes.
    pub fn read_available(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.is_open() {
            return Err(AcquisitionError::serial(
                self.name(),
                io::Error::new(io::ErrorKind::NotConnected, "port is closed"),
            ));
        }
        let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        link.read_available(buf).map_err(|e| AcquisitionError::serial(self.name(), e))
    }
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockLink;

    #[test]
    fn handle_round_trips_writes() {
        let link = MockLink::new();
        let writes = link.writes();
        let handle = PortHandle::new("ttyMock", Box::new(link));

        handle.write(&[0x23, 0x01]).expect("write succeeds");
        assert_eq!(writes.lock().unwrap().as_slice(), &[vec![0x23, 0x01]]);
    }

    #[test]
    fn closed_handle_rejects_io() {
        let handle = PortHandle::new("ttyMock", Box::new(MockLink::new()));
        handle.close();

        assert!(!handle.is_open());
        assert!(handle.write(&[0x00]).is_err());
        let mut buf = [0u8; 16];
        assert!(handle.read_available(&mut buf).is_err());
    }

    #[test]
    fn queued_bytes_come_back_out() {
        let link = MockLink::new();
        link.queue_read(&[0xAA, 0xBB]);
        let handle = PortHandle::new("ttyMock", Box::new(link));

        let mut buf = [0u8; 16];
        let n = handle.read_available(&mut buf).expect("read succeeds");
        assert_eq!(&buf[..n], &[0xAA, 0xBB]);
        assert_eq!(handle.read_available(&mut buf).expect("empty read"), 0);
    }
}
