//! Per-port listener thread.
//!
//! One OS thread per serial port pumps bytes through the framer and decoder
//! and hands every decoded packet to the coordinator over the packet queue.
//! The thread itself never touches shared sensor state.
//!
//! The listener self-heals against stuck or garbled streams: if bytes keep
//! accumulating without ever completing a block, the framing buffer is
//! cleared and the stream resynchronizes at the next marker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::protocol::framer::BlockFramer;
use crate::protocol::packet::Packet;
use crate::serial::PortHandle;

/// Pacing sleep between read cycles while running.
pub(crate) const RUNNING_PACE: Duration = Duration::from_millis(25);

/// Poll interval while paused.
pub(crate) const PAUSED_PACE: Duration = Duration::from_millis(250);

/// How long the framing buffer may sit without yielding a block before it
/// is declared stalled and cleared.
pub(crate) const IDLE_RESET: Duration = Duration::from_secs(10);

/// Listener lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// A decoded packet tagged with the port it arrived on.
#[derive(Debug)]
pub struct RoutedPacket {
    pub port: String,
    pub packet: Packet,
}

/// Handle to one listener thread.
pub struct PortListener {
    port: String,
    alive: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PortListener {
    /// Spawn the listener thread for a port. It starts in the running state
    /// and forwards packets until stopped or the receiver goes away.
    pub fn spawn(handle: PortHandle, tx: mpsc::UnboundedSender<RoutedPacket>) -> Self {
        let port = handle.name().to_string();
        let alive = Arc::new(AtomicBool::new(true));
        let active = Arc::new(AtomicBool::new(true));
        let started = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));

        let flags =
            (Arc::clone(&alive), Arc::clone(&active), Arc::clone(&started), Arc::clone(&stopped));
        let thread_port = port.clone();
        let thread = thread::Builder::new()
            .name(format!("listener-{port}"))
            .spawn(move || {
                let (alive, active, started, stopped) = flags;
                started.store(true, Ordering::Release);
                run(thread_port, handle, tx, &alive, &active);
                stopped.store(true, Ordering::Release);
            })
            .expect("spawning listener thread");

        Self { port, alive, active, started, stopped, thread: Some(thread) }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> ListenerState {
        if self.stopped.load(Ordering::Acquire) || !self.alive.load(Ordering::Acquire) {
            ListenerState::Stopped
        } else if !self.started.load(Ordering::Acquire) {
            ListenerState::Idle
        } else if self.active.load(Ordering::Acquire) {
            ListenerState::Running
        } else {
            ListenerState::Paused
        }
    }

    /// Suspend reading without losing the port (cooperative pause).
    pub fn pause(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn resume(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Signal the thread to exit and join it. The loop observes the flag at
    /// least once per pacing sleep, so the join is bounded.
    pub fn stop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(port = %self.port, "listener thread panicked");
            }
        }
    }
}

impl Drop for PortListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    port: String,
    handle: PortHandle,
    tx: mpsc::UnboundedSender<RoutedPacket>,
    alive: &AtomicBool,
    active: &AtomicBool,
) {
    info!(port = %port, "listener started");
    let mut framer = BlockFramer::new();
    let mut buf = [0u8; 512];
    let mut last_block = Instant::now();

    while alive.load(Ordering::Acquire) {
        if !active.load(Ordering::Acquire) {
            thread::sleep(PAUSED_PACE);
            continue;
        }

        let n = match handle.read_available(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                if !handle.is_open() {
                    info!(port = %port, "port closed, listener exiting");
                    break;
                }
                warn!(port = %port, error = %e, "serial read failed");
                thread::sleep(RUNNING_PACE);
                continue;
            }
        };

        if n > 0 {
            trace!(port = %port, bytes = n, "read");
            for result in framer.push(&buf[..n]) {
                match result {
                    Ok(block) => {
                        last_block = Instant::now();
                        match Packet::decode(&block) {
                            Ok(packet) => {
                                if tx
                                    .send(RoutedPacket { port: port.clone(), packet })
                                    .is_err()
                                {
                                    debug!(port = %port, "coordinator gone, listener exiting");
                                    return;
                                }
                            }
                            Err(e) => warn!(port = %port, error = %e, "packet discarded"),
                        }
                    }
                    Err(e) => warn!(port = %port, error = %e, "framing error"),
                }
            }
        }

        if framer.pending() > 0 && last_block.elapsed() > IDLE_RESET {
            warn!(
                port = %port,
                buffered = framer.pending(),
                "no block for {IDLE_RESET:?}, clearing stalled buffer"
            );
            framer.reset();
            last_block = Instant::now();
        }

        thread::sleep(RUNNING_PACE);
    }
    info!(port = %port, "listener stopped");
}
