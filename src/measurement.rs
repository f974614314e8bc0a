//! Raw measurement values as retrieved from the instrument.
//!
//! These carry no derived colorimetry; they are the bytes-off-the-wire
//! results plus enough metadata to attribute them to a device.

use crate::error::{Error, Result};

/// Regular wavelength grid of a spectral measurement, in nanometers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralShape {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl SpectralShape {
    /// Number of samples on this grid, endpoints inclusive.
    pub fn wavelength_count(&self) -> usize {
        if self.step <= 0.0 || self.end < self.start {
            return 0;
        }
        ((self.end - self.start) / self.step).round() as usize + 1
    }

    /// The wavelengths of this grid, low to high.
    pub fn wavelengths(&self) -> impl Iterator<Item = f64> + '_ {
        let start = self.start;
        let step = self.step;
        (0..self.wavelength_count()).map(move |i| start + i as f64 * step)
    }
}

/// One spectral power distribution read from a spectroradiometer.
#[derive(Debug, Clone)]
pub struct RawSpectrum {
    pub shape: SpectralShape,
    /// One sample per grid wavelength.
    pub samples: Vec<f64>,
    /// Exposure used for this measurement, in seconds.
    pub exposure: f64,
    /// Readable id of the measuring device, `"<model> - <serial>"`.
    pub device_id: String,
}

/// One XYZ tristimulus reading from a colorimeter.
#[derive(Debug, Clone)]
pub struct RawTristimulus {
    pub xyz: [f64; 3],
    /// Exposure used for this measurement, in seconds.
    pub exposure: f64,
    /// Readable id of the measuring device, `"<model> - <serial>"`.
    pub device_id: String,
}

/// Parse an exposure report such as `"27.2ms"` into seconds.
///
/// The instrument appends a unit suffix to a millisecond count; the numeric
/// prefix is taken and converted. No numeric prefix at all means the frame
/// is not an exposure report.
pub(crate) fn exposure_seconds(value: &str) -> Result<f64> {
    let value = value.trim();
    let end = value
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    value[..end]
        .parse::<f64>()
        .map(|millis| millis / 1000.0)
        .map_err(|_| Error::Protocol(format!("unparseable exposure report '{value}'")))
}
