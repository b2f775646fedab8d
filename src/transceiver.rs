//! Byte-stream transports for the bus engine.
//!
//! [`Transceiver`] abstracts the open/close lifecycle and liveness reporting
//! the engine needs on top of raw reads and writes. Two implementations are
//! provided: [`SerialTransceiver`] for a live RS-485 adapter and
//! [`FileReplayer`] for replaying previously captured bus traffic.

use std::fs::File;
use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, info};

/// Bus rate used by Infinity equipment.
pub const BUS_BAUD: u32 = 38_400;

/// Default serial read timeout. This bounds how long the engine's worker can
/// sit inside a read, and therefore how long `shutdown()` may block.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// An abstract bidirectional byte channel with explicit lifecycle.
///
/// The engine owns its transceiver exclusively while running and drives the
/// whole lifecycle itself: it (re)opens a closed channel at the top of each
/// loop iteration and closes it after a read error. Implementations therefore
/// only need to manage the handle; retry policy lives in the engine.
pub trait Transceiver: Send {
    /// Acquire the underlying channel. Calling this while already open simply
    /// replaces the handle.
    fn open(&mut self) -> io::Result<()>;

    /// Release the channel. After this returns, `is_open()` is false.
    fn close(&mut self) -> io::Result<()>;

    /// Read available bytes into `buf`. May legitimately return `Ok(0)`
    /// (nothing arrived within the transport's timeout) or an error such as
    /// end-of-data on a replay source.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes to the channel. Replay transports report success without
    /// emitting anything, since captured history is immutable.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Whether the channel handle is currently acquired.
    fn is_open(&self) -> bool;

    /// Whether this transport can ever be (re)opened again. A replay source
    /// that has been exhausted is permanently invalid; a live port always
    /// reports true.
    fn is_valid(&self) -> bool;
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transceiver is not open")
}

/// Live serial-port transport.
pub struct SerialTransceiver {
    device: String,
    read_timeout: Duration,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransceiver {
    /// Create an unopened transceiver for a device path like `/dev/ttyUSB0`.
    pub fn new(device: &str) -> Self {
        SerialTransceiver {
            device: device.to_string(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            port: None,
        }
    }

    /// Override the read timeout before opening.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

impl Transceiver for SerialTransceiver {
    fn open(&mut self) -> io::Result<()> {
        debug!("Opening serial port {} at {} baud", self.device, BUS_BAUD);
        let port = serialport::new(&self.device, BUS_BAUD)
            .timeout(self.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the handle releases the port.
        self.port = None;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.as_mut().ok_or_else(not_open)?.read(buf) {
            Ok(n) => Ok(n),
            // A timed-out read just means the bus was quiet.
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.as_mut().ok_or_else(not_open)?.write(buf)
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn is_valid(&self) -> bool {
        true
    }
}

/// Replay transport over a binary capture file.
///
/// Writes are accepted and discarded. Once the file is exhausted the
/// transceiver becomes permanently invalid, which is how the engine knows a
/// replay session is over.
pub struct FileReplayer {
    path: std::path::PathBuf,
    file: Option<File>,
    at_eof: bool,
}

impl FileReplayer {
    pub fn new<P: Into<std::path::PathBuf>>(path: P) -> Self {
        FileReplayer {
            path: path.into(),
            file: None,
            at_eof: false,
        }
    }
}

impl Transceiver for FileReplayer {
    fn open(&mut self) -> io::Result<()> {
        info!("Opening capture file {}", self.path.display());
        self.file = Some(File::open(&self.path)?);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.as_mut().ok_or_else(not_open)?.read(buf)?;
        if n == 0 {
            // End of captured history; this source will never produce again.
            self.at_eof = true;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "capture file exhausted",
            ));
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Pretend the whole write happened; history is read-only.
        Ok(buf.len())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn is_valid(&self) -> bool {
        !self.at_eof
    }
}
