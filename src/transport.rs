//! Byte-level serial transport.
//!
//! [`Transport`] is the seam between the command channel and the wire. The
//! production implementation wraps a [`tokio_serial`] port behind a
//! [`BufReader`]; tests substitute in-memory duplex streams or scripted
//! stubs through the same trait.
//!
//! Colorimetry Research instruments talk 115200 baud, 8 data bits, no
//! parity, one stop bit, with RTS/CTS hardware flow control.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_serial::SerialPortBuilderExt;

use crate::error::{Error, Result};
use crate::protocol::LINE_TERMINATOR;

/// Line rate used by every CR instrument.
pub const BAUD_RATE: u32 = 115_200;

/// A drain pass stops once the line stays quiet this long.
const DRAIN_QUIET_WINDOW: Duration = Duration::from_millis(5);

/// Object-safe alias for async byte streams usable as a serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Boxed serial stream, so transports over real ports and in-memory pipes
/// share one concrete type.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Half-duplex byte transport for one instrument.
#[async_trait]
pub trait Transport: Send {
    /// Read and discard stale bytes until the line goes quiet or `budget`
    /// elapses. Returns the number of bytes discarded.
    async fn drain(&mut self, budget: Duration) -> usize;

    /// Write `bytes` to the port and flush.
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read one terminated line, waiting at most `timeout`.
    ///
    /// A miss of the deadline is [`io::ErrorKind::TimedOut`]; a closed
    /// stream is [`io::ErrorKind::UnexpectedEof`].
    async fn read_until_terminator(&mut self, timeout: Duration) -> io::Result<Vec<u8>>;

    /// The port path this transport is bound to.
    fn port_name(&self) -> &str;
}

/// [`Transport`] over a buffered async serial stream.
pub struct SerialTransport {
    reader: BufReader<DynSerial>,
    port_name: String,
}

impl SerialTransport {
    /// Open `path` with the CR line settings.
    ///
    /// `tokio_serial` opens ports synchronously, so the open runs on the
    /// blocking pool.
    pub async fn open(path: &str) -> Result<Self> {
        let owned = path.to_string();
        let port = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&owned, BAUD_RATE)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::Hardware)
                .open_native_async()
        })
        .await
        .map_err(|e| Error::Connection {
            port: path.to_string(),
            message: format!("open task failed: {e}"),
        })?
        .map_err(|e| Error::Connection {
            port: path.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self::from_io(Box::new(port), path))
    }

    /// Wrap an already-open byte stream. Used by tests and by callers that
    /// bring their own transport.
    pub fn from_io(io: DynSerial, port_name: &str) -> Self {
        Self {
            reader: BufReader::new(io),
            port_name: port_name.to_string(),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn drain(&mut self, budget: Duration) -> usize {
        // Anything already buffered is stale by definition.
        let buffered = self.reader.buffer().len();
        if buffered > 0 {
            self.reader.consume(buffered);
        }
        let mut total = buffered;

        let deadline = tokio::time::Instant::now() + budget;
        let mut discard = [0u8; 256];
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(
                DRAIN_QUIET_WINDOW,
                self.reader.get_mut().read(&mut discard),
            )
            .await
            {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total += n,
                Ok(Err(_)) => break,
                // Quiet window elapsed with nothing pending.
                Err(_) => break,
            }
        }
        total
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.reader.get_mut().write_all(bytes).await?;
        self.reader.get_mut().flush().await
    }

    async fn read_until_terminator(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        match tokio::time::timeout(timeout, self.reader.read_until(LINE_TERMINATOR, &mut line))
            .await
        {
            Ok(Ok(0)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial stream closed",
            )),
            Ok(Ok(_)) => Ok(line),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no terminated response before deadline",
            )),
        }
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }
}
