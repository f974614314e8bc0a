//! Error taxonomy for the protocol engine.
//!
//! Every failure mode a caller can hit is a named variant so that retry
//! policy can be decided by matching instead of string inspection. Transport
//! primitives report plain [`std::io::Error`]; the command channel converts
//! deadline misses into [`Error::Timeout`] so the offending command and its
//! budget survive into the error.

use std::time::Duration;

use thiserror::Error;

use crate::device::InstrumentType;

/// All errors produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The serial port could not be opened or configured.
    #[error("failed to open serial port '{port}': {message}")]
    Connection { port: String, message: String },

    /// No terminated response arrived within the command's time budget.
    #[error("no response to '{command}' within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// A response frame arrived but could not be understood, or did not
    /// belong to the command that was sent.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The instrument answered with an error status.
    #[error("instrument rejected '{command}': {detail}")]
    Command { command: String, detail: String },

    /// The port hosts a Colorimetry Research instrument of the wrong family.
    #[error("instrument reports type '{reported}', expected '{expected}'")]
    InstrumentTypeMismatch {
        expected: InstrumentType,
        reported: InstrumentType,
    },

    /// Discovery probed every candidate port without finding a match.
    #[error("no {wanted} found on {probed} candidate port(s)")]
    NotFound {
        wanted: InstrumentType,
        probed: usize,
    },

    /// A configuration value could not be parsed or is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The handle was closed, either explicitly or by an earlier I/O failure.
    #[error("device handle is closed")]
    Closed,

    /// Transport-level I/O failure other than a timeout.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
