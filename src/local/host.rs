//! Test host that runs a configured command once per device.
//!
//! The command receives the device identity in its environment
//! (`TARGET_MAC`, `TARGET_PORT`, `TARGET_IP`, `TRIGGER_STATE`, `TEST_LIST`)
//! and its exit code becomes the device's result.

use std::net::IpAddr;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::harness::{ReadyListener, TargetHost, TargetInfo};
use crate::results::{ResultRecord, ResultSet};

/// Result name before the command starts.
pub const STARTUP_TEST: &str = "startup";

/// Result name of the command run.
pub const RUN_TEST: &str = "run";

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Created,
    Waiting,
    Running,
    /// SIGTERM sent, waiting for the command to exit.
    Stopping,
    Done,
    Terminated,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Waiting => "waiting",
            Stage::Running => "running",
            Stage::Stopping => "stopping",
            Stage::Done => "done",
            Stage::Terminated => "terminated",
        }
    }
}

pub struct CommandHost {
    target: TargetInfo,
    command: Vec<String>,
    tests: Vec<String>,
    stage: Stage,
    ip: Option<IpAddr>,
    ip_state: Option<String>,
    child: Option<Child>,
    /// When a stopping command is escalated to SIGKILL.
    kill_at: Option<Instant>,
    ready_listener: Option<ReadyListener>,
    results: ResultSet,
    config: serde_json::Value,
}

impl CommandHost {
    pub fn new(target: TargetInfo, command: Vec<String>, tests: Vec<String>) -> Self {
        Self {
            target,
            command,
            tests,
            stage: Stage::Created,
            ip: None,
            ip_state: None,
            child: None,
            kill_at: None,
            ready_listener: None,
            results: ResultSet::new(),
            config: serde_json::Value::Null,
        }
    }

    fn spawn(&self, state: &str, ip: Option<IpAddr>) -> Result<Option<Child>> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(None);
        };
        let child = Command::new(program)
            .args(args)
            .env("TARGET_MAC", self.target.mac.as_str())
            .env("TARGET_PORT", self.target.port.to_string())
            .env("TARGET_GROUP", &self.target.group)
            .env("TARGET_IP", ip.map(|ip| ip.to_string()).unwrap_or_default())
            .env("TRIGGER_STATE", state)
            .env("TEST_LIST", self.tests.join(" "))
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn host command '{}'", program))?;
        Ok(Some(child))
    }

    fn finish(&mut self, code: i64) {
        info!(port = self.target.port, mac = %self.target.mac, code, "host command finished");
        self.results
            .insert(RUN_TEST.to_string(), ResultRecord::with_code(code));
        self.stage = Stage::Done;
    }

    /// Ask the command to exit. The idle handler reaps it, escalating to
    /// SIGKILL once the grace period has passed.
    fn signal_stop(&mut self) {
        let Some(child) = self.child.as_ref() else {
            return;
        };
        unsafe {
            libc::kill(child.id() as i32, libc::SIGTERM);
        }
        self.kill_at = Some(Instant::now() + TERMINATE_GRACE);
    }

    fn poll_stopping(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            self.stage = Stage::Terminated;
            return Ok(());
        };
        if let Some(status) = child.try_wait().context("failed to poll stopping host command")? {
            debug!(port = self.target.port, exit_code = status.code(), "host command exited after SIGTERM");
            self.child = None;
            self.kill_at = None;
            self.stage = Stage::Terminated;
            return Ok(());
        }
        if self.kill_at.is_some_and(|at| Instant::now() >= at) {
            warn!(port = self.target.port, "host command did not exit after SIGTERM, sending SIGKILL");
            self.kill_at = None;
            if let Err(e) = child.kill() {
                warn!(error = %e, "failed to SIGKILL host command");
            }
        }
        Ok(())
    }
}

impl TargetHost for CommandHost {
    fn initialize(&mut self) -> Result<()> {
        info!(port = self.target.port, mac = %self.target.mac, "host initialized");
        self.stage = Stage::Waiting;
        if let Some(listener) = self.ready_listener.as_mut() {
            listener();
        }
        Ok(())
    }

    fn register_dhcp_ready_listener(&mut self, listener: ReadyListener) {
        self.ready_listener = Some(listener);
    }

    fn heartbeat(&mut self) {
        debug!(port = self.target.port, stage = self.stage.as_str(), "host heartbeat");
    }

    fn ip_notify(&mut self, ip: Option<IpAddr>, state: &str, delta_sec: i64) {
        debug!(port = self.target.port, ?ip, state, delta_sec, "host ip notify");
        self.ip = ip;
        self.ip_state = Some(state.to_string());
    }

    fn trigger_ready(&self) -> bool {
        self.stage == Stage::Waiting
    }

    fn notify_activate(&mut self) -> bool {
        self.stage == Stage::Waiting
    }

    fn trigger(&mut self, state: &str, ip: Option<IpAddr>, delta_sec: i64) -> bool {
        if self.stage != Stage::Waiting {
            debug!(port = self.target.port, stage = self.stage.as_str(), "ignoring trigger");
            return false;
        }
        info!(port = self.target.port, state, ?ip, delta_sec, "host triggered");
        let ip = ip.or(self.ip);
        match self.spawn(state, ip) {
            Ok(Some(child)) => {
                self.child = Some(child);
                self.stage = Stage::Running;
            }
            Ok(None) => self.finish(0),
            Err(e) => {
                self.record_result(STARTUP_TEST, Some(format!("{e:#}")));
                self.stage = Stage::Done;
            }
        }
        true
    }

    fn terminate(&mut self, reason: &str, trigger: bool) {
        info!(port = self.target.port, reason, trigger, stage = self.stage.as_str(), "host terminate");
        match self.stage {
            Stage::Running => {
                self.signal_stop();
                self.record_result(RUN_TEST, Some(reason.to_string()));
                self.stage = Stage::Stopping;
            }
            Stage::Stopping => {}
            _ => self.stage = Stage::Terminated,
        }
    }

    fn is_running(&self) -> bool {
        matches!(
            self.stage,
            Stage::Created | Stage::Waiting | Stage::Running | Stage::Stopping
        )
    }

    fn idle_handler(&mut self) -> Result<()> {
        if self.stage == Stage::Stopping {
            return self.poll_stopping();
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        if let Some(status) = child.try_wait().context("failed to poll host command")? {
            self.child = None;
            self.finish(status.code().map_or(-1, i64::from));
        }
        Ok(())
    }

    fn record_result(&mut self, name: &str, exception: Option<String>) {
        let record = ResultRecord {
            exception,
            ..ResultRecord::default()
        };
        self.results.insert(name.to_string(), record);
    }

    fn results(&self) -> &ResultSet {
        &self.results
    }

    fn test_name(&self) -> String {
        match self.stage {
            Stage::Running | Stage::Stopping | Stage::Done => RUN_TEST.to_string(),
            _ => STARTUP_TEST.to_string(),
        }
    }

    fn state(&self) -> String {
        self.stage.as_str().to_string()
    }

    fn reload_config(&mut self, config: &serde_json::Value) {
        info!(port = self.target.port, "host config reloaded");
        self.config = config.clone();
    }
}

impl Drop for CommandHost {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn target() -> TargetInfo {
        TargetInfo {
            port: 5,
            group: "g".to_string(),
            fake: false,
            port_set: 5,
            mac: "02:00:00:00:00:05".parse().unwrap(),
        }
    }

    fn wait_done(host: &mut CommandHost) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while host.is_running() && Instant::now() < deadline {
            host.idle_handler().unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_initialize_signals_ready() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut host = CommandHost::new(target(), Vec::new(), Vec::new());
        host.register_dhcp_ready_listener(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        host.initialize().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(host.trigger_ready());
        assert!(host.notify_activate());
        assert_eq!(host.state(), "waiting");
    }

    #[test]
    fn test_empty_command_passes_immediately() {
        let mut host = CommandHost::new(target(), Vec::new(), Vec::new());
        host.initialize().unwrap();
        assert!(host.trigger("static", None, 0));
        assert!(!host.is_running());
        assert_eq!(host.results()[RUN_TEST].code, Some(0));
        assert!(!host.trigger("static", None, 0), "second trigger is refused");
    }

    #[test]
    fn test_command_exit_code_is_recorded() {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "test \"$TARGET_PORT\" = 5 && exit 3".to_string(),
        ];
        let mut host = CommandHost::new(target(), command, vec!["ping".to_string()]);
        host.initialize().unwrap();
        assert!(host.trigger("static", Some("10.0.0.5".parse().unwrap()), 1));
        assert_eq!(host.test_name(), RUN_TEST);
        wait_done(&mut host);
        assert_eq!(host.results()[RUN_TEST].code, Some(3));
    }

    #[test]
    fn test_terminate_running_command() {
        let command = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        let mut host = CommandHost::new(target(), command, Vec::new());
        host.initialize().unwrap();
        assert!(host.trigger("static", None, 0));
        assert!(host.is_running());
        host.terminate("port not active", false);
        assert_eq!(host.state(), "stopping");
        wait_done(&mut host);
        assert!(!host.is_running());
        assert_eq!(host.state(), "terminated");
        assert_eq!(
            host.results()[RUN_TEST].exception.as_deref(),
            Some("port not active")
        );
    }

    #[test]
    fn test_terminate_does_not_wait_for_stubborn_command() {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "trap '' TERM; sleep 30".to_string(),
        ];
        let mut host = CommandHost::new(target(), command, Vec::new());
        host.initialize().unwrap();
        assert!(host.trigger("static", None, 0));
        // Let the shell install its trap.
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        host.terminate("runner exit", true);
        assert!(started.elapsed() < Duration::from_secs(1));
        host.idle_handler().unwrap();
        assert!(host.is_running(), "SIGTERM is ignored until the grace period ends");

        host.kill_at = Some(Instant::now());
        wait_done(&mut host);
        assert!(!host.is_running());
        assert_eq!(
            host.results()[RUN_TEST].exception.as_deref(),
            Some("runner exit")
        );
    }

    #[test]
    fn test_spawn_failure_is_recorded() {
        let command = vec!["/nonexistent/qualrig-host".to_string()];
        let mut host = CommandHost::new(target(), command, Vec::new());
        host.initialize().unwrap();
        assert!(host.trigger("static", None, 0));
        assert!(!host.is_running());
        assert!(host.results()[STARTUP_TEST].exception.is_some());
    }
}
