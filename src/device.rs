//! Family-independent device handle.
//!
//! [`DeviceHandle`] owns the command channel for one port, tracks the
//! connection lifecycle, caches the instrument's fixed identity fields, and
//! exposes the exposure-averaging setting shared by every CR family. The
//! family modules build on it for triggering and result retrieval.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::channel::CommandChannel;
use crate::error::{Error, Result};
use crate::protocol::{CommandResponse, ResponseType};
use crate::transport::{SerialTransport, Transport};

/// Manufacturer of every instrument this crate speaks to. The protocol has
/// no query for it.
pub const MANUFACTURER: &str = "Colorimetry Research";

/// Identity command answered by every CR family; discovery probes with it.
pub(crate) const INSTRUMENT_TYPE_COMMAND: &str = "RC InstrumentType";

/// Bounds the firmware enforces on the exposure sample count.
pub const MIN_AVERAGE_SAMPLES: u32 = 1;
pub const MAX_AVERAGE_SAMPLES: u32 = 50;

/// Instrument family, as reported by `RC InstrumentType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentType {
    Photometer,
    Colorimeter,
    Spectroradiometer,
    /// Reported a type code this crate does not know.
    Unknown,
}

impl InstrumentType {
    pub(crate) fn from_wire(token: &str) -> Self {
        match token.trim() {
            "0" => InstrumentType::Photometer,
            "1" => InstrumentType::Colorimeter,
            "2" => InstrumentType::Spectroradiometer,
            _ => InstrumentType::Unknown,
        }
    }
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentType::Photometer => "photometer",
            InstrumentType::Colorimeter => "colorimeter",
            InstrumentType::Spectroradiometer => "spectroradiometer",
            InstrumentType::Unknown => "unknown instrument",
        };
        f.write_str(name)
    }
}

/// Device model, as reported by `RC Model`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Model {
    Cr300,
    Cr250,
    /// A CR instrument this crate has no special handling for.
    Other(String),
}

impl Model {
    pub(crate) fn from_wire(token: &str) -> Self {
        match token.trim() {
            "CR-300" => Model::Cr300,
            "CR-250" => Model::Cr250,
            other => Model::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Model::Cr300 => "CR-300",
            Model::Cr250 => "CR-250",
            Model::Other(name) => name,
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    /// Transport open, instrument family verified.
    Identified,
    Ready,
    Measuring,
    /// Terminal. Entered on close or on any I/O failure.
    Closed,
}

/// A populate-once cache slot for a fixed identity field.
///
/// Identity fields cannot change while a handle is open, so a filled slot is
/// never invalidated. A fresh handle starts empty, which covers the
/// reconnect case.
#[derive(Debug)]
struct CachedField<T> {
    value: Option<T>,
}

// Not derived: a derive would bound T: Default, and a slot starts empty
// regardless of what it will hold.
impl<T> Default for CachedField<T> {
    fn default() -> Self {
        Self { value: None }
    }
}

impl<T: Clone> CachedField<T> {
    fn get(&self) -> Option<T> {
        self.value.clone()
    }

    fn fill(&mut self, value: T) -> T {
        self.value = Some(value.clone());
        value
    }
}

/// Handle to one connected instrument.
pub struct DeviceHandle {
    channel: CommandChannel,
    state: DeviceState,
    instrument_type: CachedField<InstrumentType>,
    model: CachedField<Model>,
    firmware: CachedField<String>,
    serial_number: CachedField<String>,
    aperture: CachedField<String>,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("state", &self.state)
            .field("instrument_type", &self.instrument_type)
            .field("model", &self.model)
            .field("firmware", &self.firmware)
            .field("serial_number", &self.serial_number)
            .field("aperture", &self.aperture)
            .finish_non_exhaustive()
    }
}

impl DeviceHandle {
    /// Open `port` and verify it hosts an instrument of the `expected`
    /// family. A mismatch is fatal; the handle is not usable afterwards.
    pub async fn connect(port: &str, expected: InstrumentType) -> Result<Self> {
        let transport = SerialTransport::open(port).await?;
        Self::with_transport(Box::new(transport), expected).await
    }

    /// Build a handle over an already-open transport and run the same
    /// family verification as [`DeviceHandle::connect`].
    pub async fn with_transport(
        transport: Box<dyn Transport>,
        expected: InstrumentType,
    ) -> Result<Self> {
        let mut handle = Self {
            channel: CommandChannel::new(transport),
            state: DeviceState::Connecting,
            instrument_type: CachedField::default(),
            model: CachedField::default(),
            firmware: CachedField::default(),
            serial_number: CachedField::default(),
            aperture: CachedField::default(),
        };

        let reported = handle.instrument_type().await?;
        if reported != expected {
            handle.state = DeviceState::Closed;
            return Err(Error::InstrumentTypeMismatch { expected, reported });
        }
        handle.state = DeviceState::Identified;
        debug!(port = handle.channel.port_name(), %reported, "instrument identified");
        handle.state = DeviceState::Ready;
        Ok(handle)
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn port_name(&self) -> &str {
        self.channel.port_name()
    }

    /// Close the handle. Idempotent; every later send fails with
    /// [`Error::Closed`].
    pub fn close(&mut self) {
        self.state = DeviceState::Closed;
    }

    /// Send a command through the channel, demoting the handle to `Closed`
    /// if the transport fails underneath it.
    pub(crate) async fn send(
        &mut self,
        command: &str,
        expected: ResponseType,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        if self.state == DeviceState::Closed {
            return Err(Error::Closed);
        }
        match self.channel.send(command, expected, timeout).await {
            Err(e @ Error::Io(_)) => {
                self.state = DeviceState::Closed;
                Err(e)
            }
            other => other,
        }
    }

    pub(crate) async fn send_default(
        &mut self,
        command: &str,
        expected: ResponseType,
    ) -> Result<CommandResponse> {
        self.send(command, expected, crate::channel::DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    /// Send a single-value query and return its value field.
    pub(crate) async fn query_value(
        &mut self,
        command: &str,
        expected: ResponseType,
    ) -> Result<String> {
        let response = self.send_default(command, expected).await?;
        response.value(command)
    }

    pub(crate) fn begin_measuring(&mut self) -> Result<()> {
        match self.state {
            DeviceState::Ready => {
                self.state = DeviceState::Measuring;
                Ok(())
            }
            DeviceState::Closed => Err(Error::Closed),
            other => Err(Error::Protocol(format!(
                "measurement triggered in state {other:?}"
            ))),
        }
    }

    pub(crate) fn end_measuring(&mut self) {
        if self.state == DeviceState::Measuring {
            self.state = DeviceState::Ready;
        }
    }

    /// Manufacturer name. Constant for every CR instrument.
    pub fn manufacturer(&self) -> &'static str {
        MANUFACTURER
    }

    /// Instrument family. Queried once, then served from cache.
    pub async fn instrument_type(&mut self) -> Result<InstrumentType> {
        if let Some(cached) = self.instrument_type.get() {
            return Ok(cached);
        }
        let value = self
            .query_value(INSTRUMENT_TYPE_COMMAND, ResponseType::Identity)
            .await?;
        Ok(self.instrument_type.fill(InstrumentType::from_wire(&value)))
    }

    /// Device model. Queried once, then served from cache.
    pub async fn model(&mut self) -> Result<Model> {
        if let Some(cached) = self.model.get() {
            return Ok(cached);
        }
        let value = self.query_value("RC Model", ResponseType::Identity).await?;
        Ok(self.model.fill(Model::from_wire(&value)))
    }

    /// Firmware revision. Queried once, then served from cache.
    pub async fn firmware(&mut self) -> Result<String> {
        if let Some(cached) = self.firmware.get() {
            return Ok(cached);
        }
        let value = self.query_value("RC Firmware", ResponseType::Identity).await?;
        Ok(self.firmware.fill(value))
    }

    /// Serial number. Queried once, then served from cache.
    pub async fn serial_number(&mut self) -> Result<String> {
        if let Some(cached) = self.serial_number.get() {
            return Ok(cached);
        }
        let value = self.query_value("RC ID", ResponseType::Identity).await?;
        Ok(self.serial_number.fill(value))
    }

    /// Installed aperture description. Queried once, then served from cache.
    pub async fn aperture(&mut self) -> Result<String> {
        if let Some(cached) = self.aperture.get() {
            return Ok(cached);
        }
        let value = self.query_value("RS Aperture", ResponseType::Read).await?;
        Ok(self.aperture.fill(value))
    }

    /// Human-readable device id, `"<model> - <serial>"`.
    pub async fn readable_id(&mut self) -> Result<String> {
        let model = self.model().await?;
        let serial = self.serial_number().await?;
        Ok(format!("{model} - {serial}"))
    }

    /// Number of exposures averaged per measurement.
    ///
    /// Never cached: the front panel can change it behind the handle's
    /// back, and measurement time budgets are computed from it.
    pub async fn average_samples(&mut self) -> Result<u32> {
        let value = self.query_value("RS ExposureX", ResponseType::Read).await?;
        value.parse().map_err(|_| {
            Error::Protocol(format!("'RS ExposureX' returned non-integer '{value}'"))
        })
    }

    /// Set the exposure sample count, clamped to the instrument's
    /// supported range of [1, 50].
    pub async fn set_average_samples(&mut self, samples: u32) -> Result<()> {
        let clamped = samples.clamp(MIN_AVERAGE_SAMPLES, MAX_AVERAGE_SAMPLES);
        if clamped != samples {
            debug!(requested = samples, clamped, "exposure sample count clamped");
        }
        self.send_default(&format!("SM ExposureX {clamped}"), ResponseType::Set)
            .await?;
        Ok(())
    }
}
