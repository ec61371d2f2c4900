//! Line-framed serial transport.
//!
//! The worker owns exactly one [`Transport`] and is the only component that
//! touches it. The trait is the seam for tests and exotic hardware: anything
//! that can write a terminated line, read one back with a timeout, and
//! report a baud rate qualifies. Real hardware goes through
//! [`SerialTransport`] on a `tokio_serial::SerialStream`; tests typically
//! wrap one end of a `tokio::io::duplex` pair in a [`FramedPort`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::spawn_blocking;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crate::config::{LineTerminator, StewardConfig};
use crate::error::{classify_io, Result, StewardError, TransportErrorKind};

/// Exclusive handle to a line-framed device link.
#[async_trait]
pub trait Transport: Send {
    /// Write one payload line, terminator appended, and flush.
    async fn write_line(&mut self, payload: &str) -> Result<()>;

    /// Read one reply line within the configured timeout, terminator
    /// stripped.
    async fn read_line(&mut self) -> Result<String>;

    /// Discard any stale bytes sitting in the input buffer. Returns the
    /// number of bytes dropped.
    async fn drain_input(&mut self) -> usize;

    /// Current baud rate.
    fn baud_rate(&self) -> Result<u32>;

    /// Change the baud rate.
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;
}

/// Opens a [`Transport`] for a device. The worker calls this on every
/// connect attempt, so a factory must be reusable.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open and configure a fresh transport per the given configuration.
    async fn open(&self, config: &StewardConfig) -> Result<Box<dyn Transport>>;
}

// =============================================================================
// FramedPort - line framing over any async byte stream
// =============================================================================

/// Line framing over an arbitrary async byte stream.
///
/// Handles terminator append on write, delimiter-bounded reads with a
/// timeout, terminator stripping, and stale-input draining. [`SerialTransport`]
/// wraps one of these around real hardware; test transports wrap a
/// `tokio::io::DuplexStream`.
pub struct FramedPort<T> {
    io: BufReader<T>,
    terminator: LineTerminator,
    read_timeout: Duration,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FramedPort<T> {
    /// Frame the given stream.
    pub fn new(io: T, terminator: LineTerminator, read_timeout: Duration) -> Self {
        Self {
            io: BufReader::new(io),
            terminator,
            read_timeout,
        }
    }

    /// Access the underlying stream (e.g. for hardware-specific settings).
    pub fn get_mut(&mut self) -> &mut T {
        self.io.get_mut()
    }

    /// Write one terminated line and flush.
    pub async fn write_line(&mut self, payload: &str) -> Result<()> {
        let io = self.io.get_mut();
        io.write_all(payload.as_bytes())
            .await
            .map_err(|e| classify_io(TransportErrorKind::Write, &e))?;
        io.write_all(self.terminator.as_str().as_bytes())
            .await
            .map_err(|e| classify_io(TransportErrorKind::Write, &e))?;
        io.flush()
            .await
            .map_err(|e| classify_io(TransportErrorKind::Write, &e))?;
        tracing::trace!(payload = %payload.escape_default(), "wrote line");
        Ok(())
    }

    /// Read until the terminator's final byte, strip the terminator, and
    /// return the line. Times out after the configured read timeout.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::with_capacity(64);
        let delimiter = self.terminator.delimiter();

        let read = tokio::time::timeout(
            self.read_timeout,
            self.io.read_until(delimiter, &mut buf),
        )
        .await;

        let n = match read {
            Err(_) => {
                return Err(StewardError::transport(
                    TransportErrorKind::Timeout,
                    format!("no reply within {:?}", self.read_timeout),
                ))
            }
            Ok(Err(e)) => return Err(classify_io(TransportErrorKind::Read, &e)),
            Ok(Ok(n)) => n,
        };

        // A zero-byte read or a line cut off before its delimiter means the
        // peer closed the link.
        if n == 0 || buf.last() != Some(&delimiter) {
            return Err(StewardError::transport(
                TransportErrorKind::Disconnected,
                "port closed while reading reply",
            ));
        }

        let raw = String::from_utf8_lossy(&buf);
        let line = match raw.strip_suffix(self.terminator.as_str()) {
            Some(stripped) => stripped.to_string(),
            // Terminator's final byte arrived without its full sequence;
            // strip just the delimiter.
            None => raw.trim_end_matches(delimiter as char).to_string(),
        };
        tracing::trace!(line = %line.escape_default(), "read line");
        Ok(line)
    }

    /// Aggressively read and discard input until none is immediately
    /// available.
    pub async fn drain_input(&mut self) -> usize {
        let mut discard = [0u8; 256];
        let mut total = 0usize;

        loop {
            match tokio::time::timeout(Duration::from_millis(5), self.io.read(&mut discard)).await
            {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total += n,
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if total > 0 {
            tracing::trace!(discarded = total, "drained stale input");
        }
        total
    }
}

// =============================================================================
// SerialTransport - real hardware
// =============================================================================

/// [`Transport`] over a real serial port.
pub struct SerialTransport {
    port: FramedPort<SerialStream>,
}

impl SerialTransport {
    /// Wrap an already-open serial stream.
    pub fn new(stream: SerialStream, terminator: LineTerminator, read_timeout: Duration) -> Self {
        Self {
            port: FramedPort::new(stream, terminator, read_timeout),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_line(&mut self, payload: &str) -> Result<()> {
        self.port.write_line(payload).await
    }

    async fn read_line(&mut self) -> Result<String> {
        self.port.read_line().await
    }

    async fn drain_input(&mut self) -> usize {
        self.port.drain_input().await
    }

    fn baud_rate(&self) -> Result<u32> {
        self.port.io.get_ref().baud_rate().map_err(|e| {
            StewardError::transport(TransportErrorKind::Configure, e.to_string())
        })
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.port.get_mut().set_baud_rate(baud).map_err(|e| {
            StewardError::transport(TransportErrorKind::Configure, e.to_string())
        })
    }
}

// =============================================================================
// SerialTransportFactory
// =============================================================================

/// Default factory: opens the configured port with 8N1, no flow control.
pub struct SerialTransportFactory;

#[async_trait]
impl TransportFactory for SerialTransportFactory {
    async fn open(&self, config: &StewardConfig) -> Result<Box<dyn Transport>> {
        ensure_port_known(&config.port)?;

        let path = config.port.clone();
        let baud = config.baud_rate;

        // Port opening is blocking; keep it off the runtime threads.
        let stream = spawn_blocking(move || {
            tokio_serial::new(&path, baud)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| {
            StewardError::transport(TransportErrorKind::Open, format!("open task failed: {e}"))
        })?
        .map_err(|e| {
            StewardError::transport(
                TransportErrorKind::Open,
                format!("failed to open '{}' at {} baud: {e}", config.port, config.baud_rate),
            )
        })?;

        tracing::debug!(port = %config.port, baud = config.baud_rate, "serial port opened");
        Ok(Box::new(SerialTransport::new(
            stream,
            config.terminator,
            config.read_timeout,
        )))
    }
}

/// Reject port paths the system does not know about. Enumeration failures
/// are ignored; the open attempt is the final arbiter then.
fn ensure_port_known(path: &str) -> Result<()> {
    let Ok(ports) = serialport::available_ports() else {
        return Ok(());
    };
    if ports.iter().any(|p| p.port_name == path) {
        return Ok(());
    }
    Err(StewardError::Configuration(format!(
        "'{path}' is not an available serial port"
    )))
}
