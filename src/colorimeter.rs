//! CR colorimeter family (CR-100 and compatibles).
//!
//! Colorimeters measure XYZ tristimulus directly and carry a wheel of up to
//! three stackable filters. Filter positions are set by id and read back by
//! name; id 0 is the empty "None" slot. The trigger budget is a fixed floor
//! plus a per-sample allowance, since colorimeter exposures are short but
//! the firmware re-exposes once per averaged sample.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::instrument;

use crate::device::{DeviceHandle, InstrumentType};
use crate::discovery;
use crate::error::{Error, Result};
use crate::measurement::{self, RawTristimulus};
use crate::protocol::{CommandResponse, ResponseType};
use crate::transport::Transport;

/// Budget for retrieving an already-measured XYZ triple.
const XYZ_READ_TIMEOUT: Duration = Duration::from_millis(210);

/// Fixed floor of the trigger budget.
const TRIGGER_BASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Trigger allowance per averaged exposure sample.
const TRIGGER_PER_SAMPLE: Duration = Duration::from_millis(500);

/// Filter id of the empty wheel slot.
pub const NO_FILTER: u32 = 0;

/// Number of filter positions on the wheel.
pub const FILTER_POSITIONS: usize = 3;

/// Connection settings for a colorimeter, as read from a `[device]` table
/// in a TOML config.
#[derive(Debug, Clone, Deserialize)]
pub struct ColorimeterConfig {
    /// Serial port path. When absent the port is discovered.
    pub port: Option<String>,
    /// Exposure sample count to apply after connecting.
    #[serde(default)]
    pub average_samples: Option<u32>,
}

/// Handle to a connected CR colorimeter.
pub struct Colorimeter {
    device: DeviceHandle,
    available_filters: Option<BTreeMap<u32, String>>,
}

impl Colorimeter {
    /// Connect to the colorimeter on `port`.
    pub async fn connect(port: &str) -> Result<Self> {
        let device = DeviceHandle::connect(port, InstrumentType::Colorimeter).await?;
        Self::from_device(device).await
    }

    /// Probe candidate ports and connect to the first colorimeter found.
    pub async fn discover() -> Result<Self> {
        let candidates = discovery::candidate_ports();
        let device = discovery::discover(
            InstrumentType::Colorimeter,
            &candidates,
            discovery::DEFAULT_PROBE_TIMEOUT,
        )
        .await?;
        Self::from_device(device).await
    }

    /// Build over an already-open transport. Used by tests and simulators.
    pub async fn with_transport(transport: Box<dyn Transport>) -> Result<Self> {
        let device = DeviceHandle::with_transport(transport, InstrumentType::Colorimeter).await?;
        Self::from_device(device).await
    }

    /// Connect according to a parsed TOML table.
    pub async fn from_config(config: toml::Value) -> Result<Self> {
        let config: ColorimeterConfig = config
            .try_into()
            .map_err(|e| Error::Config(e.to_string()))?;
        let mut instrument = match &config.port {
            Some(port) => Self::connect(port).await?,
            None => Self::discover().await?,
        };
        if let Some(samples) = config.average_samples {
            instrument.device.set_average_samples(samples).await?;
        }
        Ok(instrument)
    }

    async fn from_device(device: DeviceHandle) -> Result<Self> {
        let mut instrument = Self {
            device,
            available_filters: None,
        };
        instrument.check_filter_selection().await?;
        Ok(instrument)
    }

    /// The underlying device handle, for identity queries and settings.
    pub fn device(&mut self) -> &mut DeviceHandle {
        &mut self.device
    }

    /// Filters installed in this instrument, keyed by id. Id 0 is always
    /// the empty "None" slot. Queried once, then served from cache.
    pub async fn available_filters(&mut self) -> Result<BTreeMap<u32, String>> {
        if let Some(cached) = &self.available_filters {
            return Ok(cached.clone());
        }
        let response = self
            .device
            .send_default("RC Filter", ResponseType::Identity)
            .await?;
        let filters = parse_filter_table(&response)?;
        self.available_filters = Some(filters.clone());
        Ok(filters)
    }

    /// Filter ids currently selected in the wheel positions, in position
    /// order. Unoccupied positions report [`NO_FILTER`].
    pub async fn current_filters(&mut self) -> Result<Vec<u32>> {
        let filters = self.available_filters().await?;
        let response = self
            .device
            .send_default("RS Filter", ResponseType::Read)
            .await?;
        response
            .arguments
            .iter()
            .map(|name| {
                let name = name.trim();
                filters
                    .iter()
                    .find(|(_, n)| n.as_str() == name)
                    .map(|(id, _)| *id)
                    .ok_or_else(|| {
                        Error::Protocol(format!("instrument reports unknown filter '{name}'"))
                    })
            })
            .collect()
    }

    /// Select filters by id, position by position. Positions beyond the
    /// slice are cleared. At most [`FILTER_POSITIONS`] ids are accepted.
    pub async fn set_current_filters(&mut self, selection: &[u32]) -> Result<()> {
        if selection.len() > FILTER_POSITIONS {
            return Err(Error::Config(format!(
                "{} filter ids given, the wheel has {FILTER_POSITIONS} positions",
                selection.len()
            )));
        }
        let filters = self.available_filters().await?;
        for id in selection {
            if !filters.contains_key(id) {
                return Err(Error::Config(format!("no filter with id {id} installed")));
            }
        }
        for position in 1..=FILTER_POSITIONS {
            // The clear command takes -1, not the empty slot id.
            let id: i64 = selection
                .get(position - 1)
                .map(|id| i64::from(*id))
                .unwrap_or(-1);
            self.device
                .send_default(&format!("SM Filter{position} {id}"), ResponseType::Set)
                .await?;
        }
        self.check_filter_selection().await
    }

    /// Log what the wheel is actually doing, so a misconfigured filter
    /// stack shows up in the session log before the first measurement.
    async fn check_filter_selection(&mut self) -> Result<()> {
        let filters = self.available_filters().await?;
        let current = self.current_filters().await?;
        let active: Vec<&str> = current
            .iter()
            .filter(|id| **id != NO_FILTER)
            .filter_map(|id| filters.get(id).map(String::as_str))
            .collect();
        match active.len() {
            0 => log::warn!("colorimeter measuring with no filter"),
            1 => log::warn!("colorimeter measuring through filter {}", active[0]),
            _ => log::warn!(
                "colorimeter measuring through stacked filters {}",
                active.join(" + ")
            ),
        }
        Ok(())
    }

    /// Trigger one measurement and retrieve the XYZ triple.
    #[instrument(skip(self), err)]
    pub async fn measure(&mut self) -> Result<RawTristimulus> {
        self.device.begin_measuring()?;
        let result = self.raw_measure().await;
        self.device.end_measuring();
        result
    }

    async fn raw_measure(&mut self) -> Result<RawTristimulus> {
        let samples = self.device.average_samples().await?;
        let trigger_timeout = TRIGGER_BASE_TIMEOUT + TRIGGER_PER_SAMPLE * samples;
        self.device
            .send("M", ResponseType::Measurement, trigger_timeout)
            .await?;

        let response = self
            .device
            .send("RM XYZ", ResponseType::Measurement, XYZ_READ_TIMEOUT)
            .await?;
        let xyz = parse_tristimulus(&response)?;

        let exposure_report = self
            .device
            .query_value("RM Exposure", ResponseType::Measurement)
            .await?;
        let exposure = measurement::exposure_seconds(&exposure_report)?;
        let device_id = self.device.readable_id().await?;

        Ok(RawTristimulus {
            xyz,
            exposure,
            device_id,
        })
    }
}

/// Parse an `RC Filter` response: id,name pairs for every installed
/// filter. The empty slot is added under id 0.
fn parse_filter_table(response: &CommandResponse) -> Result<BTreeMap<u32, String>> {
    if response.arguments.len() % 2 != 0 {
        return Err(Error::Protocol(
            "unpaired field in filter table response".to_string(),
        ));
    }
    let mut filters = BTreeMap::new();
    let mut fields = response.arguments.iter();
    while let (Some(id), Some(name)) = (fields.next(), fields.next()) {
        let id: u32 = id.trim().parse().map_err(|_| {
            Error::Protocol(format!("non-numeric filter id '{id}' in filter table"))
        })?;
        filters.insert(id, name.clone());
    }
    filters.insert(NO_FILTER, "None".to_string());
    Ok(filters)
}

/// Parse an `RM XYZ` response. The triple occupies the last three fields.
fn parse_tristimulus(response: &CommandResponse) -> Result<[f64; 3]> {
    if response.arguments.len() < 3 {
        return Err(Error::Protocol(format!(
            "XYZ response has {} field(s), expected 3",
            response.arguments.len()
        )));
    }
    let tail = &response.arguments[response.arguments.len() - 3..];
    let mut xyz = [0.0; 3];
    for (slot, field) in xyz.iter_mut().zip(tail) {
        *slot = field
            .parse()
            .map_err(|_| Error::Protocol(format!("non-numeric XYZ component '{field}'")))?;
    }
    Ok(xyz)
}
