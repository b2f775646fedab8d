//! # Infinibus - Carrier Infinity HVAC serial bus toolkit
//!
//! Infinibus decodes the proprietary frame protocol spoken between Carrier
//! Infinity HVAC controllers on their shared RS-485 serial bus, and can replay
//! previously captured bus traffic for offline analysis.
//!
//! ## Features
//!
//! - **Self-healing framing**: the protocol has no sync byte, so the engine
//!   treats every byte offset as a candidate frame start and uses the CRC-16
//!   checksum to recover alignment one byte at a time after corruption.
//! - **Pluggable transports**: live serial ports and capture-file replay
//!   behind one [`transceiver::Transceiver`] trait.
//! - **Probe callbacks**: register observers that receive every decoded
//!   frame, in arrival order.
//! - **Clean lifecycle**: one background worker per bus, cooperative
//!   shutdown with a blocking join, and an observable terminal state when a
//!   replay source runs dry.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use infinibus::bus::Bus;
//! use infinibus::transceiver::SerialTransceiver;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut bus = Bus::new(Box::new(SerialTransceiver::new("/dev/ttyUSB0")));
//!     bus.probe(|frame| println!("{frame}"))?;
//!     bus.start()?;
//!     // ... frames flow to the probe until:
//!     bus.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`frame`] - wire format: header layout, operation codes, CRC-16 codec
//! - [`transceiver`] - byte-stream transports (serial port, file replay)
//! - [`bus`] - the streaming/resync engine and its lifecycle state machine
//! - [`logutil`] - hex formatting helpers for byte-level logging

pub mod bus;
pub mod frame;
pub mod logutil;
pub mod transceiver;
