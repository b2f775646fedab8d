//! Frame-level bus engine on top of a [`Transceiver`].
//!
//! [`Bus`] owns a transceiver, runs one background worker that accumulates raw
//! bytes and extracts checksum-valid frames from them, and hands every decoded
//! frame to the registered probe callbacks. The wire protocol has no sync
//! byte, so alignment recovery works by sliding the candidate window one byte
//! forward after every failed decode; a confirmed frame advances the window
//! past itself.
//!
//! Lifecycle is a small state machine: `Ready -> Running -> Stopping -> Ready`
//! for the normal start/shutdown cycle, with `Invalid` entered (and never
//! left) when the transceiver reports it can no longer be reopened — an
//! exhausted replay capture, for example.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::frame::{Frame, FRAME_OVERHEAD};
use crate::logutil::hex_snippet;
use crate::transceiver::Transceiver;

/// Scratch buffer size for each transceiver read. Not protocol-significant;
/// large enough to drain a chatty bus in few syscalls.
const READ_CHUNK: usize = 1024;

/// Back-off after a failed transceiver open, to keep a dead device path from
/// turning the worker into a busy loop.
const REOPEN_DELAY: Duration = Duration::from_millis(100);

/// Callback invoked once per successfully decoded frame, on the worker thread.
pub type Probe = Box<dyn Fn(&Frame) + Send + Sync>;

/// Transceiver handle shared between the engine, its worker, and (read-mostly)
/// the embedding application.
pub type SharedTransceiver = Arc<Mutex<Box<dyn Transceiver>>>;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BusState {
    /// Constructed or cleanly shut down; `start()` is legal.
    Ready = 0,
    /// Worker is running.
    Running = 1,
    /// Cooperative stop requested; worker exits at its next iteration.
    Stopping = 2,
    /// Transceiver can never be reopened. Absorbing.
    Invalid = 3,
}

impl BusState {
    fn from_u8(raw: u8) -> BusState {
        match raw {
            0 => BusState::Ready,
            1 => BusState::Running,
            2 => BusState::Stopping,
            _ => BusState::Invalid,
        }
    }
}

/// Lifecycle contract violations, returned synchronously to the caller.
/// Decode and transport faults never surface here; the worker recovers from
/// those on its own.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// `start()` (or probe registration) requires the `Ready` state.
    #[error("bus is not in the READY state")]
    NotReady,
    /// `shutdown()` requires `Running` or `Invalid`.
    #[error("bus is not RUNNING or INVALID")]
    NotRunning,
    /// The worker thread could not be spawned.
    #[error("failed to spawn bus worker: {0}")]
    Spawn(#[from] io::Error),
}

/// Frame-based interactions atop a [`Transceiver`].
pub struct Bus {
    transceiver: SharedTransceiver,
    probes: Arc<Vec<Probe>>,
    state: Arc<AtomicU8>,
    worker: Option<JoinHandle<()>>,
}

impl Bus {
    /// Build an engine around a transceiver. The transceiver does not need to
    /// be open yet; the worker opens (and reopens) it as required.
    pub fn new(transceiver: Box<dyn Transceiver>) -> Bus {
        Bus {
            transceiver: Arc::new(Mutex::new(transceiver)),
            probes: Arc::new(Vec::new()),
            state: Arc::new(AtomicU8::new(BusState::Ready as u8)),
            worker: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BusState {
        BusState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Shared handle to the underlying transceiver, for callers that want to
    /// poll `is_open()`/`is_valid()` while the engine runs. The worker locks
    /// it once per loop iteration, so holding this lock for long stalls
    /// reception.
    pub fn transceiver(&self) -> SharedTransceiver {
        Arc::clone(&self.transceiver)
    }

    /// Register a callback to receive every decoded frame.
    ///
    /// Probes run synchronously on the worker, in registration order; a probe
    /// that blocks stalls the read loop. The registry is frozen while a
    /// worker holds it, so registration is only possible before `start()`
    /// (or between a completed `shutdown()` and the next start).
    pub fn probe<F>(&mut self, callback: F) -> Result<(), BusError>
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        match Arc::get_mut(&mut self.probes) {
            Some(probes) => {
                probes.push(Box::new(callback));
                Ok(())
            }
            None => Err(BusError::NotReady),
        }
    }

    /// Start the engine: transitions `Ready -> Running` and spawns the
    /// worker. Returns immediately; frames begin flowing to probes as the
    /// worker reads them.
    pub fn start(&mut self) -> Result<(), BusError> {
        if self
            .state
            .compare_exchange(
                BusState::Ready as u8,
                BusState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(BusError::NotReady);
        }

        let transceiver = Arc::clone(&self.transceiver);
        let probes = Arc::clone(&self.probes);
        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name("bus-read-loop".to_string())
            .spawn(move || read_loop(&transceiver, &probes, &state));
        match handle {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.store(BusState::Ready as u8, Ordering::SeqCst);
                Err(BusError::Spawn(e))
            }
        }
    }

    /// Stop the engine and wait for the worker to exit.
    ///
    /// From `Running` this requests a cooperative stop, joins the worker
    /// (bounded by one transceiver read timeout), and returns the engine to
    /// `Ready`. From `Invalid` it joins the already-dead worker and leaves
    /// the state `Invalid`, so a shutdown attempt is always safe regardless
    /// of how the engine died. From `Ready` or `Stopping` it fails with
    /// [`BusError::NotRunning`].
    pub fn shutdown(&mut self) -> Result<(), BusError> {
        match self.state() {
            BusState::Running | BusState::Invalid => {
                // The worker may flip to Invalid at any point, including
                // between our state() load above and here; both stores are
                // compare-exchanges so a concurrent Invalid transition is
                // never clobbered and stays sticky.
                let _ = self.state.compare_exchange(
                    BusState::Running as u8,
                    BusState::Stopping as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                self.join_worker();
                let _ = self.state.compare_exchange(
                    BusState::Stopping as u8,
                    BusState::Ready as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                Ok(())
            }
            BusState::Ready | BusState::Stopping => Err(BusError::NotRunning),
        }
    }

    /// Encode `frame` and write it through the transceiver.
    ///
    /// This is the raw write path only — no bus arbitration, no pairing of
    /// requests with responses. Returns the byte count the transport reported.
    pub fn send(&self, frame: &Frame) -> io::Result<usize> {
        let wire = frame.encode();
        debug!("Sending {} ({} bytes)", frame, wire.len());
        let mut transceiver = self
            .transceiver
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "transceiver lock poisoned"))?;
        transceiver.write(&wire)
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Bus worker exited by panic (probe misbehaved?)");
            }
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        // Best-effort stop so a forgotten shutdown doesn't leave the worker
        // reading from a port we're about to lose.
        if self.state() == BusState::Running {
            let _ = self.shutdown();
        } else {
            self.join_worker();
        }
    }
}

/// Worker body: accumulate bytes from the transceiver and extract frames
/// until stopped or the transceiver becomes permanently invalid.
fn read_loop(transceiver: &SharedTransceiver, probes: &[Probe], state: &AtomicU8) {
    info!("Bus read loop starting");

    let mut frame_buf: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; READ_CHUNK];

    // Stop request is checked once per iteration; a worker blocked inside
    // read() observes it after at most one read timeout.
    let went_invalid = loop {
        if BusState::from_u8(state.load(Ordering::SeqCst)) != BusState::Running {
            break false;
        }

        let mut t = match transceiver.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Transceiver lock poisoned; bus read loop exiting");
                break false;
            }
        };

        if !t.is_valid() {
            break true;
        }

        if !t.is_open() {
            // Anything buffered belonged to the previous session of this
            // transport; alignment is meaningless across a reopen.
            frame_buf.clear();
            if let Err(e) = t.open() {
                warn!("Failed to open transceiver: {e}");
                drop(t);
                thread::sleep(REOPEN_DELAY);
                continue;
            }
        }

        match t.read(&mut read_buf) {
            Ok(n) => {
                drop(t);
                if n > 0 {
                    trace!("Read {} bytes: {}", n, hex_snippet(&read_buf[..n], 64));
                    frame_buf.extend_from_slice(&read_buf[..n]);
                }
                extract_frames(&mut frame_buf, probes);
            }
            Err(e) => {
                // Transient transport fault: drop the handle and let the top
                // of the loop reopen it. If the transport is actually done
                // for good, is_valid() ends the loop instead.
                warn!("Transceiver read error ({e}); closing for reopen");
                if let Err(close_err) = t.close() {
                    warn!("Transceiver close failed: {close_err}");
                }
            }
        }
    };

    if went_invalid {
        state.store(BusState::Invalid as u8, Ordering::SeqCst);
        info!("Transceiver no longer valid; bus is now INVALID");
    }
    info!("Bus read loop finished");
}

/// Pull every complete frame out of the front of `frame_buf`.
///
/// Candidate length comes from the declared payload length at offset 4. A
/// valid frame is dispatched and consumed whole; a failed decode (idle zeros
/// or checksum mismatch) discards exactly one byte, because the most likely
/// cause is a single dropped or corrupt byte and everything behind it may
/// still be a real frame.
fn extract_frames(frame_buf: &mut Vec<u8>, probes: &[Probe]) {
    loop {
        // Smallest possible frame is a bare header + checksum.
        if frame_buf.len() < FRAME_OVERHEAD {
            break;
        }

        let frame_len = frame_buf[4] as usize + FRAME_OVERHEAD;
        if frame_buf.len() < frame_len {
            // Could be a real frame still arriving; wait for more bytes.
            break;
        }

        match Frame::decode(&frame_buf[..frame_len]) {
            Ok(frame) => {
                debug!("Frame: {frame}");
                for probe in probes {
                    probe(&frame);
                }
                frame_buf.drain(..frame_len);
            }
            Err(e) => {
                trace!("Resync, advancing one byte: {e}");
                frame_buf.drain(..1);
            }
        }
    }
}
