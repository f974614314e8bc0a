//! Serial protocol engine for Colorimetry Research photometric instruments.
//!
//! This crate speaks the newline-terminated ASCII command protocol of the
//! CR instrument line over USB serial: framing and response decoding, the
//! timing discipline the instruments require between commands, port
//! discovery, identity caching, and the measurement sequences of the two
//! instrument families.
//!
//! - [`Spectroradiometer`] for the CR-300 / CR-250 spectroradiometers,
//!   returning raw spectral power distributions.
//! - [`Colorimeter`] for the filter-wheel colorimeters, returning raw XYZ
//!   tristimulus readings.
//!
//! ```no_run
//! use photolink::Spectroradiometer;
//!
//! # async fn run() -> photolink::Result<()> {
//! let mut meter = Spectroradiometer::discover().await?;
//! let spectrum = meter.measure().await?;
//! println!("{}: {} samples", spectrum.device_id, spectrum.samples.len());
//! # Ok(())
//! # }
//! ```
//!
//! The layering is bottom-up: [`transport`] moves bytes, [`protocol`]
//! frames them, [`channel`] serializes command/response exchanges with the
//! required inter-command spacing, [`device`] adds lifecycle and identity
//! caching, and the family modules sit on top. Every layer below the
//! families is usable on its own for talking to a CR instrument directly.

pub mod channel;
pub mod colorimeter;
pub mod device;
pub mod discovery;
pub mod error;
pub mod measurement;
pub mod protocol;
pub mod spectroradiometer;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use channel::{CommandChannel, DEFAULT_COMMAND_TIMEOUT, MIN_COMMAND_SPACING};
pub use colorimeter::{Colorimeter, ColorimeterConfig, FILTER_POSITIONS, NO_FILTER};
pub use device::{
    DeviceHandle, DeviceState, InstrumentType, Model, MANUFACTURER, MAX_AVERAGE_SAMPLES,
    MIN_AVERAGE_SAMPLES,
};
pub use discovery::{candidate_ports, discover, DEFAULT_PROBE_TIMEOUT};
pub use error::{Error, Result};
pub use measurement::{RawSpectrum, RawTristimulus, SpectralShape};
pub use protocol::{CommandResponse, ResponseCode, ResponseType};
pub use spectroradiometer::{MeasurementSpeed, Spectroradiometer, SpectroradiometerConfig};
pub use transport::{SerialTransport, Transport, BAUD_RATE};
