//! Scripted transport stub shared by the unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::transport::Transport;

/// In-memory [`Transport`] that answers each written command through a
/// closure and logs every command it sees.
///
/// The closure returns the response line without its terminator; `None`
/// means the instrument stays silent and the read times out.
pub(crate) struct StubTransport {
    respond: Box<dyn FnMut(&str) -> Option<String> + Send>,
    pending: VecDeque<Vec<u8>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl StubTransport {
    pub(crate) fn new(respond: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            pending: VecDeque::new(),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared log of every command written to this stub.
    pub(crate) fn commands(&self) -> Arc<Mutex<Vec<String>>> {
        self.commands.clone()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn drain(&mut self, _budget: Duration) -> usize {
        let stale: usize = self.pending.iter().map(Vec::len).sum();
        self.pending.clear();
        stale
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let command = String::from_utf8_lossy(bytes).trim_end().to_string();
        if let Ok(mut log) = self.commands.lock() {
            log.push(command.clone());
        }
        if let Some(response) = (self.respond)(&command) {
            self.pending.push_back(format!("{response}\n").into_bytes());
        }
        Ok(())
    }

    async fn read_until_terminator(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        match self.pending.pop_front() {
            Some(line) => Ok(line),
            None => {
                tokio::time::sleep(timeout).await;
                Err(io::Error::new(io::ErrorKind::TimedOut, "stub is silent"))
            }
        }
    }

    fn port_name(&self) -> &str {
        "stub"
    }
}
