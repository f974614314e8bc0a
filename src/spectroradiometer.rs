//! CR spectroradiometer family (CR-300, CR-250).
//!
//! Measurement is a three-step exchange: `M` arms and runs the exposure,
//! `RM Spectrum` retrieves the spectral data, `RM Exposure` reports the
//! exposure actually used. The trigger budget scales with the configured
//! measurement speed and the exposure sample count, since in automatic
//! exposure mode the instrument may integrate for the full per-sample
//! window before answering.

use std::time::Duration;

use serde::Deserialize;
use tracing::instrument;

use crate::device::{DeviceHandle, InstrumentType, Model};
use crate::discovery;
use crate::error::{Error, Result};
use crate::measurement::{self, RawSpectrum, SpectralShape};
use crate::protocol::{CommandResponse, ResponseType};
use crate::transport::Transport;

/// Budget for retrieving an already-measured spectrum.
const SPECTRUM_READ_TIMEOUT: Duration = Duration::from_millis(310);

/// Exposure speed presets of the spectroradiometer firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeasurementSpeed {
    Slow,
    #[default]
    Normal,
    Fast,
    Fast2x,
}

impl MeasurementSpeed {
    fn command_argument(self) -> &'static str {
        match self {
            MeasurementSpeed::Slow => "0",
            MeasurementSpeed::Normal => "1",
            MeasurementSpeed::Fast => "2",
            MeasurementSpeed::Fast2x => "3",
        }
    }

    /// Accepts both the numeric code and the label the firmware reports.
    pub(crate) fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "0" | "slow" => Some(MeasurementSpeed::Slow),
            "1" | "normal" => Some(MeasurementSpeed::Normal),
            "2" | "fast" => Some(MeasurementSpeed::Fast),
            "3" | "2x fast" => Some(MeasurementSpeed::Fast2x),
            _ => None,
        }
    }

    /// Worst-case trigger time per averaged exposure sample.
    fn trigger_window(self) -> Duration {
        match self {
            MeasurementSpeed::Slow => Duration::from_secs(70),
            MeasurementSpeed::Normal => Duration::from_secs(21),
            MeasurementSpeed::Fast => Duration::from_secs(14),
            MeasurementSpeed::Fast2x => Duration::from_secs(7),
        }
    }
}

/// Connection settings for a spectroradiometer, as read from a `[device]`
/// table in a TOML config.
#[derive(Debug, Clone, Deserialize)]
pub struct SpectroradiometerConfig {
    /// Serial port path. When absent the port is discovered.
    pub port: Option<String>,
    /// Speed preset label, e.g. `"normal"` or `"2x fast"`.
    #[serde(default)]
    pub speed: Option<String>,
    /// Exposure sample count to apply after connecting.
    #[serde(default)]
    pub average_samples: Option<u32>,
}

/// Handle to a connected CR spectroradiometer.
pub struct Spectroradiometer {
    device: DeviceHandle,
    speed: MeasurementSpeed,
}

impl std::fmt::Debug for Spectroradiometer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spectroradiometer")
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

impl Spectroradiometer {
    /// Connect to the spectroradiometer on `port`.
    pub async fn connect(port: &str, speed: MeasurementSpeed) -> Result<Self> {
        let device = DeviceHandle::connect(port, InstrumentType::Spectroradiometer).await?;
        Self::from_device(device, speed).await
    }

    /// Probe candidate ports and connect to the first spectroradiometer
    /// found.
    pub async fn discover() -> Result<Self> {
        let candidates = discovery::candidate_ports();
        let device = discovery::discover(
            InstrumentType::Spectroradiometer,
            &candidates,
            discovery::DEFAULT_PROBE_TIMEOUT,
        )
        .await?;
        Self::from_device(device, MeasurementSpeed::default()).await
    }

    /// Build over an already-open transport. Used by tests and simulators.
    pub async fn with_transport(
        transport: Box<dyn Transport>,
        speed: MeasurementSpeed,
    ) -> Result<Self> {
        let device =
            DeviceHandle::with_transport(transport, InstrumentType::Spectroradiometer).await?;
        Self::from_device(device, speed).await
    }

    /// Connect according to a parsed TOML table.
    pub async fn from_config(config: toml::Value) -> Result<Self> {
        let config: SpectroradiometerConfig = config
            .try_into()
            .map_err(|e| Error::Config(e.to_string()))?;
        let speed = match &config.speed {
            Some(label) => MeasurementSpeed::from_label(label)
                .ok_or_else(|| Error::Config(format!("unknown measurement speed '{label}'")))?,
            None => MeasurementSpeed::default(),
        };
        let mut instrument = match &config.port {
            Some(port) => Self::connect(port, speed).await?,
            None => {
                let candidates = discovery::candidate_ports();
                let device = discovery::discover(
                    InstrumentType::Spectroradiometer,
                    &candidates,
                    discovery::DEFAULT_PROBE_TIMEOUT,
                )
                .await?;
                Self::from_device(device, speed).await?
            }
        };
        if let Some(samples) = config.average_samples {
            instrument.device.set_average_samples(samples).await?;
        }
        Ok(instrument)
    }

    async fn from_device(device: DeviceHandle, speed: MeasurementSpeed) -> Result<Self> {
        let mut instrument = Self { device, speed };
        instrument.set_measurement_speed(speed).await?;
        Ok(instrument)
    }

    /// The underlying device handle, for identity queries and settings.
    pub fn device(&mut self) -> &mut DeviceHandle {
        &mut self.device
    }

    /// The speed preset this handle last applied or read back.
    pub fn measurement_speed(&self) -> MeasurementSpeed {
        self.speed
    }

    /// Ask the instrument which speed preset is active.
    ///
    /// Also forces automatic exposure mode, which is the only mode the
    /// speed presets are meaningful in.
    pub async fn read_measurement_speed(&mut self) -> Result<MeasurementSpeed> {
        self.device
            .send_default("SM ExposureMode 0", ResponseType::Set)
            .await?;
        let label = self
            .device
            .query_value("RS Speed", ResponseType::Read)
            .await?;
        let speed = MeasurementSpeed::from_label(&label)
            .ok_or_else(|| Error::Protocol(format!("unknown speed label '{label}'")))?;
        self.speed = speed;
        Ok(speed)
    }

    /// Apply a speed preset.
    pub async fn set_measurement_speed(&mut self, speed: MeasurementSpeed) -> Result<()> {
        self.device
            .send_default(
                &format!("SM Speed {}", speed.command_argument()),
                ResponseType::Set,
            )
            .await?;
        self.speed = speed;
        Ok(())
    }

    /// Trigger one measurement and retrieve the spectrum.
    #[instrument(skip(self), err)]
    pub async fn measure(&mut self) -> Result<RawSpectrum> {
        self.device.begin_measuring()?;
        let result = self.raw_measure().await;
        self.device.end_measuring();
        result
    }

    async fn raw_measure(&mut self) -> Result<RawSpectrum> {
        let samples = self.device.average_samples().await?;
        let trigger_timeout = self.speed.trigger_window() * samples;
        self.device
            .send("M", ResponseType::Measurement, trigger_timeout)
            .await?;

        let response = self
            .device
            .send("RM Spectrum", ResponseType::Measurement, SPECTRUM_READ_TIMEOUT)
            .await?;
        let model = self.device.model().await?;
        let (shape, samples) = parse_spectrum(&model, &response)?;

        let exposure_report = self
            .device
            .query_value("RM Exposure", ResponseType::Measurement)
            .await?;
        let exposure = measurement::exposure_seconds(&exposure_report)?;
        let device_id = self.device.readable_id().await?;

        Ok(RawSpectrum {
            shape,
            samples,
            exposure,
            device_id,
        })
    }
}

/// Parse an `RM Spectrum` response: three shape fields, then one sample per
/// grid wavelength.
///
/// Some firmware revisions report an all-zero shape; the model's native
/// grid is substituted so the sample count can still be validated.
fn parse_spectrum(model: &Model, response: &CommandResponse) -> Result<(SpectralShape, Vec<f64>)> {
    if response.arguments.len() < 4 {
        return Err(Error::Protocol(format!(
            "spectrum response has {} field(s), expected shape and samples",
            response.arguments.len()
        )));
    }

    let header: Vec<f64> = response.arguments[..3]
        .iter()
        .map(|field| {
            field.parse::<f64>().map_err(|_| {
                Error::Protocol(format!("non-numeric spectrum shape field '{field}'"))
            })
        })
        .collect::<Result<_>>()?;
    let mut shape = SpectralShape {
        start: header[0],
        end: header[1],
        step: header[2],
    };
    if shape.end == 0.0 {
        shape = native_shape(model);
    }

    let samples: Vec<f64> = response.arguments[3..]
        .iter()
        .map(|field| {
            field
                .parse::<f64>()
                .map_err(|_| Error::Protocol(format!("non-numeric spectrum sample '{field}'")))
        })
        .collect::<Result<_>>()?;

    let expected = shape.wavelength_count();
    if samples.len() != expected {
        return Err(Error::Protocol(format!(
            "spectrum carries {} sample(s), grid {}..{} nm step {} needs {}",
            samples.len(),
            shape.start,
            shape.end,
            shape.step,
            expected
        )));
    }
    Ok((shape, samples))
}

/// Native wavelength grid per model, used when the instrument reports an
/// all-zero shape.
fn native_shape(model: &Model) -> SpectralShape {
    let step = match model {
        Model::Cr250 => 4.0,
        _ => 1.0,
    };
    SpectralShape {
        start: 380.0,
        end: 780.0,
        step,
    }
}
