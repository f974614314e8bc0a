//! Port discovery for CR instruments.
//!
//! Candidate ports are enumerated and filtered by platform naming
//! conventions, then probed in parallel with the family identity query.
//! Probe results are taken in candidate order, so when several ports host a
//! matching instrument the earliest candidate wins deterministically and
//! the remaining probes are cancelled.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::channel::CommandChannel;
use crate::device::{DeviceHandle, InstrumentType, INSTRUMENT_TYPE_COMMAND};
use crate::error::{Error, Result};
use crate::protocol::ResponseType;
use crate::transport::{SerialTransport, Transport};

/// Per-port budget for the identity probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Ports probed concurrently at most.
const MAX_CONCURRENT_PROBES: usize = 4;

/// Async factory for a transport on a named port. Injectable so discovery
/// is testable without hardware.
pub(crate) type PortOpener =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Box<dyn Transport>>> + Send + Sync>;

/// Enumerate serial ports that could plausibly host a CR instrument.
///
/// The instruments enumerate as USB CDC-ACM devices, which gives them
/// platform-specific names worth filtering on. On platforms without a known
/// convention every port is a candidate.
pub fn candidate_ports() -> Vec<String> {
    let Ok(ports) = serialport::available_ports() else {
        return Vec::new();
    };
    ports
        .into_iter()
        .filter(is_candidate)
        .map(|p| p.port_name)
        .collect()
}

fn is_candidate(port: &serialport::SerialPortInfo) -> bool {
    if cfg!(target_os = "macos") {
        port.port_name.contains("usbmodem")
    } else if cfg!(target_os = "linux") {
        port.port_name.contains("ACM")
    } else if cfg!(target_os = "windows") {
        matches!(
            &port.port_type,
            serialport::SerialPortType::UsbPort(usb)
                if usb.product.as_deref().is_some_and(|p| p.contains("Colorimetry"))
        )
    } else {
        true
    }
}

/// Probe `candidates` for an instrument of the `wanted` family and return a
/// connected handle to the first match.
pub async fn discover(
    wanted: InstrumentType,
    candidates: &[String],
    probe_timeout: Duration,
) -> Result<DeviceHandle> {
    let opener: PortOpener = Arc::new(|port: String| -> BoxFuture<'static, Result<Box<dyn Transport>>> {
        Box::pin(async move {
            let transport = SerialTransport::open(&port).await?;
            Ok(Box::new(transport) as Box<dyn Transport>)
        })
    });
    let port = locate_with(wanted, candidates, probe_timeout, opener.clone()).await?;
    info!(%wanted, port, "instrument located, connecting");
    // Fresh transport for the persistent handle; connect re-verifies the
    // family and a mismatch at this point is fatal.
    let transport = opener(port).await?;
    DeviceHandle::with_transport(transport, wanted).await
}

/// Probe each candidate port and return the name of the first, in candidate
/// order, that reports the `wanted` family.
///
/// Probes run concurrently under a semaphore; results are awaited in
/// candidate order so the match is deterministic, and outstanding probes
/// are aborted once a match is taken. Candidates that fail to open or to
/// answer are skipped.
pub(crate) async fn locate_with(
    wanted: InstrumentType,
    candidates: &[String],
    probe_timeout: Duration,
    opener: PortOpener,
) -> Result<String> {
    let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
    let mut probes = Vec::with_capacity(candidates.len());
    for port in candidates {
        let port = port.clone();
        let opener = opener.clone();
        let permits = permits.clone();
        let port_name = port.clone();
        let task = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            match probe_port(&port, opener, probe_timeout).await {
                Ok(reported) => Some(reported),
                Err(e) => {
                    debug!(port, error = %e, "candidate did not answer the probe");
                    None
                }
            }
        });
        probes.push((port_name, task));
    }

    let mut remaining = probes.into_iter();
    let mut matched = None;
    for (port, task) in remaining.by_ref() {
        match task.await {
            Ok(Some(reported)) if reported == wanted => {
                matched = Some(port);
                break;
            }
            Ok(Some(reported)) => {
                debug!(port, %reported, "candidate hosts a different instrument family");
            }
            Ok(None) => {}
            Err(e) => {
                debug!(port, error = %e, "probe task failed");
            }
        }
    }
    for (_, task) in remaining {
        task.abort();
    }

    matched.ok_or(Error::NotFound {
        wanted,
        probed: candidates.len(),
    })
}

/// One identity probe: open the port, ask `RC InstrumentType`, report the
/// family. The transport is dropped before the result is returned so the
/// port is free for the persistent connection.
async fn probe_port(
    port: &str,
    opener: PortOpener,
    probe_timeout: Duration,
) -> Result<InstrumentType> {
    let transport = opener(port.to_string()).await?;
    let mut channel = CommandChannel::new(transport);
    let response = channel
        .send(INSTRUMENT_TYPE_COMMAND, ResponseType::Identity, probe_timeout)
        .await?;
    let value = response.value(INSTRUMENT_TYPE_COMMAND)?;
    Ok(InstrumentType::from_wire(&value))
}
