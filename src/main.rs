//! Binary entrypoint for the infinibus CLI.
//!
//! Commands:
//! - `snoop --port <dev>` / `snoop --replay <file>` - decode and log every
//!   frame seen on a live bus or in a captured binary log
//! - `probe-device --port <dev>` - send one READ_TABLE_BLOCK request and log
//!   the traffic addressed back to us
//!
//! See the library crate docs for module-level details: `infinibus::`.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use infinibus::bus::{Bus, BusState};
use infinibus::frame::Frame;
use infinibus::transceiver::{FileReplayer, SerialTransceiver, Transceiver};

#[derive(Parser)]
#[command(name = "infinibus")]
#[command(about = "Frame decoder and snooper for the Carrier Infinity HVAC serial bus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode and log every frame on the bus
    Snoop {
        /// Serial port device (e.g., /dev/ttyUSB0)
        #[arg(short, long, conflicts_with = "replay")]
        port: Option<String>,

        /// Binary capture file to replay instead of a live port
        #[arg(short, long)]
        replay: Option<String>,
    },
    /// Send a READ_TABLE_BLOCK request and log frames addressed back to us
    ProbeDevice {
        /// Serial port device (live bus only)
        #[arg(short, long)]
        port: String,

        /// Bus address to claim for ourselves
        #[arg(short, long, default_value_t = 0x121, value_parser = parse_u16)]
        address: u16,

        /// Address of the device to probe
        #[arg(short, long, default_value_t = 0xf1f1, value_parser = parse_u16)]
        target: u16,

        /// Table index to request
        #[arg(short = 'i', long, default_value_t = 0x0001, value_parser = parse_u16)]
        table: u16,

        /// Row offset within the table
        #[arg(short, long, default_value_t = 0x01)]
        offset: u8,

        /// Seconds to wait for a response before giving up
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

/// Accept addresses as decimal or 0x-prefixed hex.
fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid 16-bit value '{s}': {e}"))
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Snoop { port, replay } => snoop(port, replay),
        Commands::ProbeDevice {
            port,
            address,
            target,
            table,
            offset,
            timeout,
        } => probe_device(&port, address, target, table, offset, timeout),
    }
}

fn snoop(port: Option<String>, replay: Option<String>) -> Result<()> {
    let mut transceiver: Box<dyn Transceiver> = match (port, replay) {
        (Some(dev), None) => Box::new(SerialTransceiver::new(&dev)),
        (None, Some(file)) => Box::new(FileReplayer::new(file)),
        _ => bail!("specify either --port (serial device) or --replay (capture file)"),
    };

    // Fail fast on an unusable source; the engine would otherwise retry forever.
    transceiver.open()?;

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);

    let mut bus = Bus::new(transceiver);
    bus.probe(move |frame| {
        counter.fetch_add(1, Ordering::Relaxed);
        info!("{frame}");
    })?;
    bus.start()?;

    let handle = bus.transceiver();
    loop {
        if bus.state() == BusState::Invalid {
            info!("Bus source exhausted");
            break;
        }
        if !handle.lock().map(|t| t.is_open()).unwrap_or(false) {
            // Worker reopens a closed transport on its own; a sustained
            // closed state here just means it is mid-recovery.
            warn!("Transceiver currently closed; waiting for reopen");
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    bus.shutdown()?;
    info!("Decoded {} frames", count.load(Ordering::Relaxed));
    Ok(())
}

fn probe_device(
    port: &str,
    address: u16,
    target: u16,
    table: u16,
    offset: u8,
    timeout: u64,
) -> Result<()> {
    let mut transceiver: Box<dyn Transceiver> = Box::new(SerialTransceiver::new(port));
    transceiver.open()?;

    let answered = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&answered);

    let mut bus = Bus::new(transceiver);
    bus.probe(move |frame| {
        if frame.header.destination == address {
            info!("Response: {frame}");
            seen.store(true, Ordering::SeqCst);
        }
    })?;
    bus.start()?;

    let request = Frame::read_table_block(target, address, table, offset);
    info!("Sending {request}");
    let written = bus.send(&request)?;
    info!("Wrote {written} bytes");

    // Responses are not always prompt on a busy bus; poll until ours shows up.
    let deadline = Instant::now() + Duration::from_secs(timeout);
    while !answered.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }

    bus.shutdown()?;
    if answered.load(Ordering::SeqCst) {
        Ok(())
    } else {
        bail!("no response from {target:#06x} within {timeout}s")
    }
}
