//! Line-delimited JSON event client over a Unix domain socket.

use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::{ControllerError, ControllerEvent, ControllerSource};

/// Client for the controller's event socket.
///
/// Reads are non-blocking; partial lines stay buffered until the rest
/// arrives.
pub struct EventClient {
    path: PathBuf,
    stream: Option<UnixStream>,
    buffer: Vec<u8>,
}

impl EventClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: None,
            buffer: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn fill(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

impl AsRawFd for EventClient {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_ref().map_or(-1, |s| s.as_raw_fd())
    }
}

impl ControllerSource for EventClient {
    fn connect(&mut self) -> Result<()> {
        let stream = UnixStream::connect(&self.path)
            .with_context(|| format!("failed to connect to event socket: {}", self.path.display()))?;
        stream
            .set_nonblocking(true)
            .context("failed to make event socket non-blocking")?;
        info!(path = %self.path.display(), "attached controller event channel");
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(path = %self.path.display(), "detached controller event channel");
        }
        self.buffer.clear();
    }

    fn next_event(&mut self) -> Result<Option<Vec<ControllerEvent>>> {
        if self.stream.is_none() {
            return Err(ControllerError::NotConnected.into());
        }
        self.fill().context("failed to read controller events")?;
        while let Some(line) = self.next_line() {
            if line.is_empty() {
                continue;
            }
            return Ok(Some(ControllerEvent::decode(&line)?));
        }
        Ok(None)
    }
}
