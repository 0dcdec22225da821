//! Interfaces to the collaborators the runner drives but does not implement:
//! per-device test hosts, per-group gateways, and the network topology.
//!
//! Every call happens on the loop thread. Collaborators that learn things
//! asynchronously (a DHCP lease, a host reaching its ready stage) report back
//! through the listener closures handed to them, which queue work for the
//! loop thread instead of touching runner state directly.

use std::collections::BTreeSet;
use std::net::IpAddr;

use serde::Serialize;

use crate::controller::{MacAddr, Port, SwitchId};
use crate::results::ResultSet;

/// IP state reported for every member of a simultaneously activated group.
pub const GROUP_STATE: &str = "group";

/// Elapsed-seconds sentinel for a group activation.
pub const GROUP_DELTA_SEC: i64 = -1;

/// Identity of one device under test, as handed to its gateway and host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetInfo {
    pub port: Port,
    pub group: String,
    pub fake: bool,
    pub port_set: usize,
    pub mac: MacAddr,
}

/// Address assignment observed by a gateway for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpTarget {
    pub mac: MacAddr,
    pub ip: Option<IpAddr>,
    pub delta_sec: i64,
}

/// DHCP / static-IP notification from a gateway.
///
/// A notification carrying `error` invalidates the whole gateway set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpNotification {
    pub state: String,
    pub target: Option<IpTarget>,
    pub gateway_set: usize,
    pub error: Option<String>,
}

/// Handed to a host; invoked when the host can accept activation.
pub type ReadyListener = Box<dyn FnMut() + Send>;

/// Handed to a gateway; invoked for every address notification.
pub type IpListener = Box<dyn FnMut(IpNotification) + Send>;

// ---------------------------------------------------------------------------
// TargetHost
// ---------------------------------------------------------------------------

/// Test-execution handle for one device.
pub trait TargetHost {
    fn initialize(&mut self) -> anyhow::Result<()>;

    fn register_dhcp_ready_listener(&mut self, listener: ReadyListener);

    fn heartbeat(&mut self);

    fn ip_notify(&mut self, ip: Option<IpAddr>, state: &str, delta_sec: i64);

    /// Host-local precondition for joining a group activation.
    fn trigger_ready(&self) -> bool;

    /// Whether an activation notice is expected right now; `false` marks
    /// the notice as spurious.
    fn notify_activate(&mut self) -> bool;

    /// Start the test sequence. Returns `false` if the host declined.
    fn trigger(&mut self, state: &str, ip: Option<IpAddr>, delta_sec: i64) -> bool;

    /// Request a graceful stop. With `trigger == false` the host must not
    /// start anything new on the way down. Must not block; a host that needs
    /// time to stop keeps reporting `is_running` until its idle handler sees
    /// it has stopped.
    fn terminate(&mut self, reason: &str, trigger: bool);

    fn is_running(&self) -> bool;

    fn idle_handler(&mut self) -> anyhow::Result<()>;

    fn record_result(&mut self, name: &str, exception: Option<String>);

    fn results(&self) -> &ResultSet;

    /// Name of the test currently executing, used to file errors.
    fn test_name(&self) -> String;

    /// Short description of the host's current stage.
    fn state(&self) -> String;

    fn reload_config(&mut self, _config: &serde_json::Value) {}
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Shared test infrastructure for one device group, bound to one slot.
pub trait Gateway {
    fn name(&self) -> &str;

    fn port_set(&self) -> usize;

    fn initialize(&mut self) -> anyhow::Result<()>;

    fn activate(&mut self);

    fn activated(&self) -> bool;

    fn fake_target(&self) -> bool;

    fn result_linger(&self) -> bool;

    fn set_result_linger(&mut self, linger: bool);

    fn attach_target(&mut self, port: Port, target: TargetInfo);

    /// Detach the target on `port`; returns whether any targets remain.
    fn detach_target(&mut self, port: Port) -> bool;

    fn targets(&self) -> Vec<TargetInfo>;

    /// Record `mac` as ready and return every ready member so far.
    fn target_ready(&mut self, mac: &MacAddr) -> BTreeSet<MacAddr>;

    fn terminate(&mut self);

    fn execute_script(&mut self, name: &str, mac: &MacAddr, value: i64) -> anyhow::Result<()>;

    fn allocate_test_port(&mut self) -> anyhow::Result<Port>;

    fn release_test_port(&mut self, test_port: Port);
}

// ---------------------------------------------------------------------------
// TopologyPolicy
// ---------------------------------------------------------------------------

/// Switch layout and device grouping.
pub trait TopologyPolicy {
    fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn device_group_for(&self, mac: &MacAddr) -> String;

    fn device_group_size(&self, group: &str) -> usize;

    fn is_system_port(&self, switch_id: SwitchId, port: Port) -> bool;

    fn is_device_port(&self, switch_id: SwitchId, port: Port) -> bool;

    /// Steer `mac` on `port` through the test path, or back to the default
    /// path when `target` is `None`.
    fn direct_port_traffic(&mut self, mac: &MacAddr, port: Port, target: Option<&TargetInfo>);
}

// ---------------------------------------------------------------------------
// HarnessFactory
// ---------------------------------------------------------------------------

/// Builds hosts and gateways on demand.
pub trait HarnessFactory {
    fn create_host(&mut self, target: &TargetInfo) -> anyhow::Result<Box<dyn TargetHost>>;

    fn create_gateway(
        &mut self,
        group: &str,
        slot: usize,
        ip_listener: IpListener,
    ) -> anyhow::Result<Box<dyn Gateway>>;

    /// Called when a device port's active state flips.
    fn clear_port(&mut self, _port: Port) {}
}
