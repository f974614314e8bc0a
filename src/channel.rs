//! One-command-at-a-time channel with timing discipline.
//!
//! CR instruments drop or corrupt commands that arrive too close together,
//! and a response that was never read stays in the OS buffer to poison the
//! next exchange. [`CommandChannel::send`] therefore runs a fixed pipeline
//! for every command: wait out the inter-command spacing, drain stale bytes,
//! write, read one terminated line under the command's time budget, decode,
//! and verify the frame answers the command that was sent.
//!
//! The channel owns its transport and takes `&mut self` to send, so at most
//! one command is ever outstanding per port.

use std::io;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{self, CommandResponse, ResponseCode, ResponseType};
use crate::transport::Transport;

/// Minimum gap between consecutive command writes.
pub const MIN_COMMAND_SPACING: Duration = Duration::from_millis(50);

/// Added on top of the spacing floor so timer rounding can never land a
/// write inside the forbidden window.
const SPACING_MARGIN: Duration = Duration::from_millis(1);

/// Time budget for commands that answer immediately.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Budget for the pre-write drain pass.
pub const DRAIN_BUDGET: Duration = Duration::from_millis(50);

/// Serialized command/response exchange over one transport.
pub struct CommandChannel {
    transport: Box<dyn Transport>,
    last_write: Option<tokio::time::Instant>,
}

impl CommandChannel {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            last_write: None,
        }
    }

    pub fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    /// Send with the default 500 ms budget.
    pub async fn send_default(
        &mut self,
        command: &str,
        expected: ResponseType,
    ) -> Result<CommandResponse> {
        self.send(command, expected, DEFAULT_COMMAND_TIMEOUT).await
    }

    /// Send one command and read its response.
    ///
    /// An `ERR` frame becomes [`Error::Command`]; a frame whose echo
    /// classifies it as answering a different command becomes
    /// [`Error::Protocol`]; a missed deadline becomes [`Error::Timeout`].
    pub async fn send(
        &mut self,
        command: &str,
        expected: ResponseType,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        if let Some(last) = self.last_write {
            let elapsed = last.elapsed();
            if elapsed < MIN_COMMAND_SPACING {
                let wait = MIN_COMMAND_SPACING - elapsed + SPACING_MARGIN;
                trace!(command, ?wait, "holding for inter-command spacing");
                tokio::time::sleep(wait).await;
            }
        }

        let discarded = self.transport.drain(DRAIN_BUDGET).await;
        if discarded > 0 {
            debug!(command, discarded, "discarded stale bytes before send");
        }

        debug!(command, "sending");
        self.transport.write(&protocol::encode_command(command)).await?;
        self.last_write = Some(tokio::time::Instant::now());

        let raw = match self.transport.read_until_terminator(timeout).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(Error::Timeout {
                    command: command.to_string(),
                    timeout,
                });
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let response = protocol::decode_response(&raw, expected)?;
        if response.code == ResponseCode::Error {
            let detail = response
                .arguments
                .first()
                .cloned()
                .unwrap_or_else(|| String::from_utf8_lossy(&response.raw).trim().to_string());
            return Err(Error::Command {
                command: command.to_string(),
                detail,
            });
        }
        if response.response_type != expected {
            return Err(Error::Protocol(format!(
                "response to '{command}' classified as {:?}, expected {:?}",
                response.response_type, expected
            )));
        }
        Ok(response)
    }
}
