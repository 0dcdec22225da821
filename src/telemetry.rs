//! Fire-and-forget status publishing.
//!
//! The runner publishes heartbeats and its effective configuration through a
//! [`Telemetry`] sink. Publishing failures are logged by the caller and never
//! interrupt the event loop.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::controller::Port;

/// Channel the runner publishes on.
pub const RUNNER_CHANNEL: &str = "runner";

pub const HEARTBEAT_KIND: &str = "heartbeat";
pub const RUNNER_CONFIG_KIND: &str = "runner_config";

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Destination for structured status messages.
pub trait Telemetry {
    fn publish(&mut self, channel: &str, kind: &str, message: serde_json::Value) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn publish(&mut self, channel: &str, kind: &str, _message: serde_json::Value) -> Result<()> {
        debug!(channel, kind, "telemetry disabled, dropping message");
        Ok(())
    }
}

/// One published message as written to the JSON-lines file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: String,
    pub channel: String,
    pub kind: String,
    pub message: serde_json::Value,
}

/// Appends every message as a JSON line, flushed per write.
pub struct JsonLinesTelemetry {
    path: PathBuf,
    writer: File,
}

impl JsonLinesTelemetry {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create telemetry directory: {}", parent.display()))?;
        }
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open telemetry log: {}", path.display()))?;
        debug!(path = %path.display(), "telemetry log opened");
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Telemetry for JsonLinesTelemetry {
    fn publish(&mut self, channel: &str, kind: &str, message: serde_json::Value) -> Result<()> {
        let envelope = Envelope {
            timestamp: Utc::now().to_rfc3339(),
            channel: channel.to_string(),
            kind: kind.to_string(),
            message,
        };
        let mut line = serde_json::to_string(&envelope).context("failed to serialize telemetry message")?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write telemetry log: {}", self.path.display()))?;
        self.writer
            .flush()
            .with_context(|| format!("failed to flush telemetry log: {}", self.path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunInfo
// ---------------------------------------------------------------------------

fn gethostname() -> OsString {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return OsString::from("localhost");
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    OsString::from(String::from_utf8_lossy(&buf[..len]).into_owned())
}

/// Identity of this process's run, attached to every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub version: String,
    pub hostname: String,
    pub run_id: Uuid,
}

impl RunInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: gethostname().to_string_lossy().into_owned(),
            run_id: Uuid::new_v4(),
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Periodic runner status message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub name: String,
    /// Configured test sequence.
    pub states: Vec<String>,
    /// Device ports with link up, learned or not.
    pub ports: Vec<Port>,
    pub description: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub run: RunInfo,
}

impl Heartbeat {
    pub fn new(states: Vec<String>, ports: Vec<Port>, description: impl Into<String>, run: RunInfo) -> Self {
        Self {
            name: "status".to_string(),
            states,
            ports,
            description: description.into(),
            timestamp: Utc::now().to_rfc3339(),
            run,
        }
    }
}
