//! TOML configuration for the qualification runner.
//!
//! Every section has compiled-in defaults, so a partial (or missing) file is
//! always usable. The file location can be overridden with `QUALRIG_CONFIG`.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::{MacAddr, Port, SwitchId};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "QUALRIG_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/qualrig/qualrig.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a runner process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualrigConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub harness: HarnessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl QualrigConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded runner configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `QUALRIG_CONFIG` environment variable.
    /// 2. `/etc/qualrig/qualrig.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "QUALRIG_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Load from `path` when given, otherwise fall back to [`Self::load_or_default`].
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Reject combinations the runner cannot work with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.runner.max_gateways > 1, "runner.max_gateways must be at least 2");
        anyhow::ensure!(
            self.runner.callback_queue_capacity > 0,
            "runner.callback_queue_capacity must be positive"
        );
        anyhow::ensure!(
            !self.topology.device_ports.contains(&self.topology.system_port),
            "topology.system_port {} is also listed as a device port",
            self.topology.system_port
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Orchestration policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Stop accepting new devices after the first completed session.
    pub single_shot: bool,
    /// Only trigger on controller events; never retry learned ports when idle.
    pub event_trigger: bool,
    /// Stop accepting new devices after the first failure.
    pub fail_mode: bool,
    /// Keep a failed group's resources alive for inspection.
    pub result_linger: bool,
    /// Stop after this many completed sessions (0 = unlimited).
    pub run_limit: u32,
    /// Size of the gateway slot pool.
    pub max_gateways: usize,
    /// Blocking poll timeout of the event loop.
    pub poll_timeout_sec: u64,
    /// Pause before the first loop pass, letting the switch settle.
    pub settle_sec: u64,
    /// Free-form site description published in heartbeats.
    pub site_description: String,
    /// Append a `hold` test to the test list.
    pub keep_hold: bool,
    /// Run no configured tests.
    pub no_test: bool,
    /// Maximum queued cross-thread callbacks. A readiness signal that finds
    /// the queue full fails its target instead of being retried.
    pub callback_queue_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            single_shot: false,
            event_trigger: false,
            fail_mode: false,
            result_linger: false,
            run_limit: 0,
            max_gateways: 10,
            poll_timeout_sec: 20,
            settle_sec: 3,
            site_description: String::new(),
            keep_hold: false,
            no_test: false,
            callback_queue_capacity: 256,
        }
    }
}

impl RunnerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_sec)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_secs(self.settle_sec)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Append-only per-port result log.
    pub result_log: PathBuf,
    /// Test-list file naming the host test sequence.
    pub host_tests: PathBuf,
    /// JSON-lines telemetry output; unset disables publishing.
    pub telemetry_log: Option<PathBuf>,
    /// Base configuration watched for changes.
    pub base_config: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            result_log: PathBuf::from("inst/result.log"),
            host_tests: PathBuf::from("config/modules/host.conf"),
            telemetry_log: None,
            base_config: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Unix socket streaming controller events as JSON lines.
    pub socket_path: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/qualrig/events.sock"),
        }
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Switch layout and device grouping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub switch_id: SwitchId,
    /// Port carrying the controller's own uplink.
    pub system_port: Port,
    /// Ports with devices under test attached.
    pub device_ports: Vec<Port>,
    /// MAC to device-group name. Unlisted MACs form a group of one.
    pub groups: BTreeMap<MacAddr, String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            switch_id: 1,
            system_port: 100,
            device_ports: (1..=8).collect(),
            groups: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Command run once per device when it is triggered. Empty runs nothing.
    pub command: Vec<String>,
    /// MAC to statically assigned address.
    pub static_ips: BTreeMap<MacAddr, IpAddr>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = QualrigConfig::default();

        assert!(!cfg.runner.single_shot);
        assert!(!cfg.runner.fail_mode);
        assert_eq!(cfg.runner.run_limit, 0);
        assert_eq!(cfg.runner.max_gateways, 10);
        assert_eq!(cfg.runner.poll_timeout(), Duration::from_secs(20));
        assert_eq!(cfg.runner.settle_time(), Duration::from_secs(3));
        assert_eq!(cfg.runner.callback_queue_capacity, 256);

        assert_eq!(cfg.paths.result_log, PathBuf::from("inst/result.log"));
        assert!(cfg.paths.telemetry_log.is_none());
        assert!(cfg.paths.base_config.is_none());

        assert_eq!(cfg.topology.system_port, 100);
        assert_eq!(cfg.topology.device_ports.len(), 8);
        assert!(cfg.harness.command.is_empty());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);

        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[runner]
fail_mode = true
run_limit = 4
max_gateways = 6
site_description = "bench 2"

[paths]
result_log = "/tmp/qualrig/result.log"
telemetry_log = "/tmp/qualrig/telemetry.jsonl"

[controller]
socket_path = "/tmp/faucet.sock"

[topology]
switch_id = 2
system_port = 48
device_ports = [1, 2, 3]

[topology.groups]
"AA:BB:CC:DD:EE:01" = "g1"
"aa:bb:cc:dd:ee:02" = "g1"

[harness]
command = ["/usr/bin/run-tests", "--quick"]

[harness.static_ips]
"aa:bb:cc:dd:ee:01" = "10.20.0.5"

[logging]
level = "debug"
json = true
"#;

        let cfg: QualrigConfig = toml::from_str(toml_str).unwrap();

        assert!(cfg.runner.fail_mode);
        assert_eq!(cfg.runner.run_limit, 4);
        assert_eq!(cfg.runner.max_gateways, 6);
        assert_eq!(cfg.runner.site_description, "bench 2");
        assert_eq!(cfg.paths.result_log, PathBuf::from("/tmp/qualrig/result.log"));
        assert_eq!(
            cfg.paths.telemetry_log,
            Some(PathBuf::from("/tmp/qualrig/telemetry.jsonl"))
        );
        assert_eq!(cfg.controller.socket_path, PathBuf::from("/tmp/faucet.sock"));
        assert_eq!(cfg.topology.switch_id, 2);
        assert_eq!(cfg.topology.device_ports, vec![1, 2, 3]);

        let m1: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        assert_eq!(cfg.topology.groups.get(&m1).map(String::as_str), Some("g1"));
        assert_eq!(cfg.topology.groups.len(), 2);
        assert_eq!(cfg.harness.command, vec!["/usr/bin/run-tests", "--quick"]);
        assert_eq!(
            cfg.harness.static_ips.get(&m1),
            Some(&"10.20.0.5".parse::<IpAddr>().unwrap())
        );
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: QualrigConfig = toml::from_str("[runner]\nsingle_shot = true\n").unwrap();
        assert!(cfg.runner.single_shot);
        assert_eq!(cfg.runner.max_gateways, 10);
        assert_eq!(cfg.topology.system_port, 100);
    }

    #[test]
    fn test_invalid_mac_rejected() {
        let toml_str = "[topology.groups]\n\"not-a-mac\" = \"g1\"\n";
        assert!(toml::from_str::<QualrigConfig>(toml_str).is_err());
    }

    #[test]
    fn test_validate_rejects_overlapping_system_port() {
        let mut cfg = QualrigConfig::default();
        cfg.topology.system_port = 3;
        assert!(cfg.validate().is_err());

        let mut cfg = QualrigConfig::default();
        cfg.runner.max_gateways = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("qualrig.toml");
        std::fs::write(&path, "[controller]\nsocket_path = \"/tmp/x.sock\"\n").unwrap();
        let cfg = QualrigConfig::load(&path).unwrap();
        assert_eq!(cfg.controller.socket_path, PathBuf::from("/tmp/x.sock"));

        assert!(QualrigConfig::load(&dir.path().join("missing.toml")).is_err());
        assert!(QualrigConfig::resolve(Some(&path)).is_ok());
    }
}
