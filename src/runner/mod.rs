//! Orchestration core.
//!
//! [`Runner`] owns every piece of domain state: the port activation table,
//! the gateway slot arena, the target sets, and the readiness caches. All of
//! it is mutated on the loop thread only, either from a [`StreamMonitor`]
//! callback or from a [`CallbackQueue`] entry drained by the loop hook.

mod gateways;
mod idle;
mod lifecycle;
mod ports;
mod readiness;

pub use gateways::{GatewayEntry, GatewaySlots};
pub use ports::PortState;
pub use readiness::Readiness;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{QualrigConfig, RunnerConfig};
use crate::controller::{ControllerSource, MacAddr, Port};
use crate::harness::{HarnessFactory, IpTarget, TargetHost, TopologyPolicy};
use crate::monitor::{Registry, StreamMonitor};
use crate::queue::CallbackQueue;
use crate::results::{ResultAggregator, ResultLog};
use crate::telemetry::{
    Heartbeat, RunInfo, Telemetry, HEARTBEAT_KIND, RUNNER_CHANNEL, RUNNER_CONFIG_KIND,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("could not allocate open gateway set ({max} slots in use)")]
    SlotsExhausted { max: usize },

    #[error("gateway for group {group} on set {slot} failed to initialize: {source}")]
    GatewayInit {
        group: String,
        slot: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("terminated")]
    Terminated,

    #[error("gateway set {0} not found")]
    UnknownGatewaySet(usize),

    #[error("no target set on port {0}")]
    MissingTarget(Port),

    #[error("readiness signal for {mac} dropped, callback queue full")]
    SignalDropped { mac: MacAddr },
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Progress of the linger-on-exit sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LingerExit {
    #[default]
    Normal,
    Armed,
    Delivered,
}

/// Process-wide run policy and counters.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_count: u32,
    pub run_limit: u32,
    pub single_shot: bool,
    pub fail_mode: bool,
    pub result_linger: bool,
    pub event_trigger: bool,
    /// Cleared once any stop policy trips; never set again.
    run_tests: bool,
    pub linger_exit: LingerExit,
}

impl RunState {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            run_count: 0,
            run_limit: config.run_limit,
            single_shot: config.single_shot,
            fail_mode: config.fail_mode,
            result_linger: config.result_linger,
            event_trigger: config.event_trigger,
            run_tests: true,
            linger_exit: LingerExit::Normal,
        }
    }

    pub fn run_tests(&self) -> bool {
        self.run_tests
    }

    /// Stop creating new target sets for the rest of the run.
    pub fn suppress_tests(&mut self, why: &str) {
        if self.run_tests {
            warn!(why, "suppressing further tests");
        }
        self.run_tests = false;
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// One device's live test session.
pub(crate) struct TargetSet {
    pub(crate) mac: MacAddr,
    pub(crate) host: Box<dyn TargetHost>,
}

/// Cached IP notification awaiting its DHCP-ready counterpart.
#[derive(Debug, Clone)]
pub(crate) struct IpInfo {
    pub(crate) state: String,
    pub(crate) target: IpTarget,
    pub(crate) slot: usize,
}

/// Readiness signal a listener could not queue for the loop thread.
#[derive(Debug, Clone)]
pub(crate) enum LostSignal {
    DhcpReady(MacAddr),
    Ip { mac: Option<MacAddr>, slot: usize },
}

/// Signals dropped on a full callback queue, replayed as failures by the
/// loop hook so the affected group does not wait forever.
#[derive(Clone, Default)]
pub(crate) struct LostSignals(Arc<Mutex<Vec<LostSignal>>>);

impl LostSignals {
    pub(crate) fn record(&self, signal: LostSignal) {
        self.lock().push(signal);
    }

    pub(crate) fn take(&self) -> Vec<LostSignal> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LostSignal>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// External collaborators the runner drives.
pub struct Collaborators {
    pub topology: Box<dyn TopologyPolicy>,
    pub factory: Box<dyn HarnessFactory>,
    pub telemetry: Box<dyn Telemetry>,
    pub controller: Box<dyn ControllerSource>,
}

pub struct Runner {
    config: RunnerConfig,
    tests: Vec<String>,
    state: RunState,

    topology: Box<dyn TopologyPolicy>,
    factory: Box<dyn HarnessFactory>,
    telemetry: Box<dyn Telemetry>,
    controller: Option<Box<dyn ControllerSource>>,

    result_log: Option<ResultLog>,
    results: ResultAggregator,

    gateways: GatewaySlots,
    device_groups: HashMap<String, usize>,
    port_gateways: HashMap<Port, usize>,
    port_targets: BTreeMap<Port, TargetSet>,
    /// Cancelled hosts that have not yet exited.
    stopping: Vec<(Port, Box<dyn TargetHost>)>,
    mac_targets: HashMap<MacAddr, Port>,
    active_ports: BTreeMap<Port, PortState>,
    system_active: bool,

    target_mac_ip: HashMap<MacAddr, Option<IpAddr>>,
    dhcp_ready: HashSet<MacAddr>,
    ip_info: HashMap<MacAddr, IpInfo>,

    queue: CallbackQueue<Runner>,
    lost_signals: LostSignals,
    run_info: RunInfo,
    base_config: serde_json::Value,
    exception: Option<String>,
}

impl Runner {
    pub fn new(
        config: &QualrigConfig,
        tests: Vec<String>,
        base_config: serde_json::Value,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let result_log = ResultLog::open(&config.paths.result_log)?;
        let run_info = RunInfo::current();
        info!(run_id = %run_info.run_id, version = %run_info.version, "qualrig run");
        info!(tests = %tests.join(", "), "configured with tests");
        Ok(Self {
            config: config.runner.clone(),
            tests,
            state: RunState::new(&config.runner),
            topology: collaborators.topology,
            factory: collaborators.factory,
            telemetry: collaborators.telemetry,
            controller: Some(collaborators.controller),
            result_log: Some(result_log),
            results: ResultAggregator::default(),
            gateways: GatewaySlots::new(config.runner.max_gateways),
            device_groups: HashMap::new(),
            port_gateways: HashMap::new(),
            port_targets: BTreeMap::new(),
            stopping: Vec::new(),
            mac_targets: HashMap::new(),
            active_ports: BTreeMap::new(),
            system_active: false,
            target_mac_ip: HashMap::new(),
            dhcp_ready: HashSet::new(),
            ip_info: HashMap::new(),
            queue: CallbackQueue::new(config.runner.callback_queue_capacity),
            lost_signals: LostSignals::default(),
            run_info,
            base_config,
            exception: None,
        })
    }

    // -----------------------------------------------------------------------
    // Run phases
    // -----------------------------------------------------------------------

    /// Publish initial status, bring up the topology, attach the controller
    /// channel, and let the switch settle.
    pub fn initialize(&mut self) -> Result<()> {
        self.send_heartbeat();
        self.publish_runner_config();

        self.topology.initialize().context("failed to initialize topology")?;

        let controller = self
            .controller
            .as_mut()
            .context("controller event channel already released")?;
        controller.connect()?;

        let settle = self.config.settle_time();
        if !settle.is_zero() {
            info!(settle_sec = settle.as_secs(), "waiting for system to settle");
            std::thread::sleep(settle);
        }
        Ok(())
    }

    /// Run the event loop until the controller channel is released.
    ///
    /// Loop-level failures are recorded as the run's exception rather than
    /// returned; every remaining target set is terminated on the way out.
    pub fn main_loop(&mut self) {
        if let Err(e) = self.run_event_loop() {
            error!(error = %format!("{e:#}"), "event loop exception");
            self.exception = Some(format!("{e:#}"));
        }
        self.terminate_all();
    }

    fn run_event_loop(&mut self) -> Result<()> {
        let mut monitor = StreamMonitor::new(Some(self.config.poll_timeout()))
            .with_idle_handler(|runner: &mut Runner, registry: &mut Registry<Runner>| {
                runner.handle_system_idle(registry)
            })
            .with_loop_hook(|runner: &mut Runner, _: &mut Registry<Runner>| {
                runner.loop_hook();
                Ok(())
            });

        let controller = self
            .controller
            .as_deref()
            .context("controller event channel not attached")?;
        monitor.registry().monitor(
            controller,
            Some(Box::new(|runner: &mut Runner, _: &mut Registry<Runner>| {
                runner.handle_controller_events()
            })),
            Some(Box::new(|runner: &mut Runner, _: &mut Registry<Runner>| {
                runner.controller_hangup();
                Ok(())
            })),
            Some(Box::new(|runner: &mut Runner, e: anyhow::Error| {
                runner.controller_error(e);
            })),
        )?;

        if self.state.event_trigger {
            self.flush_controller_events();
        }

        info!("entering main event loop");
        while monitor.event_loop(self)? {
            self.module_heartbeat();
        }
        monitor.report();
        Ok(())
    }

    /// Stop the topology and close the result log.
    pub fn cleanup(&mut self) {
        info!("stopping network");
        if let Err(e) = self.topology.stop() {
            error!(error = %format!("{e:#}"), "failed to stop topology");
        }
        self.result_log = None;
        info!("done with runner");
    }

    /// Overall verdict: 0 when every finalized result passed and the loop
    /// recorded no exception, 1 otherwise.
    pub fn finalize(&self) -> i32 {
        self.results.exit_code(self.exception.as_deref())
    }

    // -----------------------------------------------------------------------
    // Telemetry
    // -----------------------------------------------------------------------

    fn send_heartbeat(&mut self) {
        let beat = Heartbeat::new(
            self.tests.clone(),
            self.active_ports.keys().copied().collect(),
            self.config.site_description.clone(),
            self.run_info.clone(),
        );
        let result = serde_json::to_value(&beat)
            .context("failed to serialize heartbeat")
            .and_then(|message| self.telemetry.publish(RUNNER_CHANNEL, HEARTBEAT_KIND, message));
        if let Err(e) = result {
            warn!(error = %format!("{e:#}"), "heartbeat publish failed");
        }
    }

    fn publish_runner_config(&mut self) {
        let message = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "config": self.base_config,
        });
        if let Err(e) = self.telemetry.publish(RUNNER_CHANNEL, RUNNER_CONFIG_KIND, message) {
            warn!(error = %format!("{e:#}"), "runner config publish failed");
        }
    }

    /// Apply a changed base configuration: republish it and hand it to every
    /// live host.
    pub fn base_config_changed(&mut self, config: serde_json::Value) {
        info!("base config changed");
        self.base_config = config;
        self.publish_runner_config();
        for set in self.port_targets.values_mut() {
            set.host.reload_config(&self.base_config);
        }
    }

    // -----------------------------------------------------------------------
    // Test ports
    // -----------------------------------------------------------------------

    /// Allocate an auxiliary test port from the gateway serving `port`.
    pub fn allocate_test_port(&mut self, port: Port) -> Result<Port> {
        let slot = *self
            .port_gateways
            .get(&port)
            .ok_or(OrchestrationError::MissingTarget(port))?;
        let entry = self
            .gateways
            .get_mut(slot)
            .ok_or(OrchestrationError::UnknownGatewaySet(slot))?;
        entry.gateway.allocate_test_port()
    }

    pub fn release_test_port(&mut self, port: Port, test_port: Port) -> Result<()> {
        let slot = *self
            .port_gateways
            .get(&port)
            .ok_or(OrchestrationError::MissingTarget(port))?;
        let entry = self
            .gateways
            .get_mut(slot)
            .ok_or(OrchestrationError::UnknownGatewaySet(slot))?;
        entry.gateway.release_test_port(test_port);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Handle other threads use to queue work for the loop thread.
    pub fn queue_handle(&self) -> CallbackQueue<Runner> {
        self.queue.clone()
    }

    pub fn run_state(&self) -> &RunState {
        &self.state
    }

    pub fn run_tests(&self) -> bool {
        self.state.run_tests()
    }

    pub fn tests(&self) -> &[String] {
        &self.tests
    }

    pub fn has_target(&self, port: Port) -> bool {
        self.port_targets.contains_key(&port)
    }

    pub fn target_ports(&self) -> Vec<Port> {
        self.port_targets.keys().copied().collect()
    }

    /// Ports whose cancelled host is still shutting down.
    pub fn stopping_ports(&self) -> Vec<Port> {
        self.stopping.iter().map(|(port, _)| *port).collect()
    }

    pub fn port_state(&self, port: Port) -> Option<&PortState> {
        self.active_ports.get(&port)
    }

    pub fn system_active(&self) -> bool {
        self.system_active
    }

    /// Slot currently bound to `group`.
    pub fn gateway_slot(&self, group: &str) -> Option<usize> {
        self.device_groups.get(group).copied()
    }

    pub fn gateways(&self) -> &GatewaySlots {
        &self.gateways
    }

    pub fn results(&self) -> &ResultAggregator {
        &self.results
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn controller_attached(&self) -> bool {
        self.controller.is_some()
    }
}
