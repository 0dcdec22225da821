//! In-process gateway: tracks group membership and readiness, and reports
//! statically configured addresses as soon as a target attaches.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::controller::{MacAddr, Port};
use crate::harness::{Gateway, IpListener, IpNotification, IpTarget, TargetInfo};

/// First auxiliary test port; each gateway set owns a block above it.
pub const TEST_PORT_BASE: Port = 1000;

/// Auxiliary test ports per gateway set.
pub const TEST_PORTS_PER_SET: Port = 10;

/// IP state reported for a statically addressed target.
pub const STATIC_STATE: &str = "static";

/// IP state reported when no address is known for a target.
pub const UNASSIGNED_STATE: &str = "unassigned";

pub struct LocalGateway {
    name: String,
    group: String,
    slot: usize,
    activated: bool,
    result_linger: bool,
    targets: BTreeMap<Port, TargetInfo>,
    ready: BTreeSet<MacAddr>,
    static_ips: BTreeMap<MacAddr, IpAddr>,
    dhcp_response: BTreeMap<MacAddr, i64>,
    test_ports: BTreeSet<Port>,
    ip_listener: IpListener,
}

impl LocalGateway {
    pub fn new(group: &str, slot: usize, static_ips: BTreeMap<MacAddr, IpAddr>, ip_listener: IpListener) -> Self {
        Self {
            name: format!("gw{:02}", slot),
            group: group.to_string(),
            slot,
            activated: false,
            result_linger: false,
            targets: BTreeMap::new(),
            ready: BTreeSet::new(),
            static_ips,
            dhcp_response: BTreeMap::new(),
            test_ports: BTreeSet::new(),
            ip_listener,
        }
    }

    /// Current DHCP response delay for `mac` (-1 holds responses back).
    pub fn dhcp_response_time(&self, mac: &MacAddr) -> Option<i64> {
        self.dhcp_response.get(mac).copied()
    }

    fn test_port_range(&self) -> std::ops::Range<Port> {
        let start = TEST_PORT_BASE + self.slot as Port * TEST_PORTS_PER_SET;
        start..start + TEST_PORTS_PER_SET
    }
}

impl Gateway for LocalGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn port_set(&self) -> usize {
        self.slot
    }

    fn initialize(&mut self) -> Result<()> {
        info!(gateway = %self.name, group = %self.group, "gateway initialized");
        Ok(())
    }

    fn activate(&mut self) {
        info!(gateway = %self.name, group = %self.group, ready = self.ready.len(), "gateway activated");
        self.activated = true;
    }

    fn activated(&self) -> bool {
        self.activated
    }

    fn fake_target(&self) -> bool {
        false
    }

    fn result_linger(&self) -> bool {
        self.result_linger
    }

    fn set_result_linger(&mut self, linger: bool) {
        self.result_linger = linger;
    }

    fn attach_target(&mut self, port: Port, target: TargetInfo) {
        let mac = target.mac.clone();
        info!(gateway = %self.name, port, %mac, "attaching target");
        self.targets.insert(port, target);

        let ip = self.static_ips.get(&mac).copied();
        let state = if ip.is_some() { STATIC_STATE } else { UNASSIGNED_STATE };
        (self.ip_listener)(IpNotification {
            state: state.to_string(),
            target: Some(IpTarget {
                mac,
                ip,
                delta_sec: 0,
            }),
            gateway_set: self.slot,
            error: None,
        });
    }

    fn detach_target(&mut self, port: Port) -> bool {
        if let Some(target) = self.targets.remove(&port) {
            info!(gateway = %self.name, port, mac = %target.mac, "detaching target");
            self.ready.remove(&target.mac);
            self.dhcp_response.remove(&target.mac);
        }
        !self.targets.is_empty()
    }

    fn targets(&self) -> Vec<TargetInfo> {
        self.targets.values().cloned().collect()
    }

    fn target_ready(&mut self, mac: &MacAddr) -> BTreeSet<MacAddr> {
        self.ready.insert(mac.clone());
        self.ready.clone()
    }

    fn terminate(&mut self) {
        info!(gateway = %self.name, group = %self.group, "gateway terminated");
        self.targets.clear();
        self.ready.clear();
        self.test_ports.clear();
        self.activated = false;
    }

    fn execute_script(&mut self, name: &str, mac: &MacAddr, value: i64) -> Result<()> {
        match name {
            "change_dhcp_response_time" => {
                debug!(gateway = %self.name, %mac, value, "dhcp response time");
                self.dhcp_response.insert(mac.clone(), value);
                Ok(())
            }
            _ => anyhow::bail!("unknown gateway script {name}"),
        }
    }

    fn allocate_test_port(&mut self) -> Result<Port> {
        let port = self
            .test_port_range()
            .find(|p| !self.test_ports.contains(p))
            .ok_or_else(|| anyhow::anyhow!("no free test port on {}", self.name))?;
        self.test_ports.insert(port);
        debug!(gateway = %self.name, port, "allocated test port");
        Ok(port)
    }

    fn release_test_port(&mut self, test_port: Port) {
        if !self.test_ports.remove(&test_port) {
            warn!(gateway = %self.name, test_port, "releasing unallocated test port");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    fn target(port: Port, m: &MacAddr) -> TargetInfo {
        TargetInfo {
            port,
            group: "g".to_string(),
            fake: false,
            port_set: 3,
            mac: m.clone(),
        }
    }

    fn gateway(static_ips: BTreeMap<MacAddr, IpAddr>) -> (LocalGateway, Arc<Mutex<Vec<IpNotification>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let gw = LocalGateway::new(
            "g",
            3,
            static_ips,
            Box::new(move |n| sink.lock().unwrap().push(n)),
        );
        (gw, seen)
    }

    #[test]
    fn test_attach_reports_static_ip() {
        let m = mac("02:00:00:00:00:01");
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        let (mut gw, seen) = gateway(BTreeMap::from([(m.clone(), ip)]));
        gw.attach_target(1, target(1, &m));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].state, "static");
        assert_eq!(seen[0].gateway_set, 3);
        assert_eq!(seen[0].target.as_ref().unwrap().ip, Some(ip));
    }

    #[test]
    fn test_attach_without_static_ip_is_unassigned() {
        let m = mac("02:00:00:00:00:02");
        let (mut gw, seen) = gateway(BTreeMap::new());
        gw.attach_target(2, target(2, &m));
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].state, "unassigned");
        assert_eq!(seen[0].target.as_ref().unwrap().ip, None);
    }

    #[test]
    fn test_ready_set_and_detach() {
        let m1 = mac("02:00:00:00:00:01");
        let m2 = mac("02:00:00:00:00:02");
        let (mut gw, _) = gateway(BTreeMap::new());
        gw.attach_target(1, target(1, &m1));
        gw.attach_target(2, target(2, &m2));

        assert_eq!(gw.target_ready(&m1).len(), 1);
        assert_eq!(gw.target_ready(&m2).len(), 2);
        assert!(gw.detach_target(1));
        assert!(!gw.detach_target(2));
        assert!(gw.targets().is_empty());
    }

    #[test]
    fn test_dhcp_script_and_unknown_script() {
        let m = mac("02:00:00:00:00:01");
        let (mut gw, _) = gateway(BTreeMap::new());
        gw.execute_script("change_dhcp_response_time", &m, -1).unwrap();
        assert_eq!(gw.dhcp_response_time(&m), Some(-1));
        assert!(gw.execute_script("reboot", &m, 0).is_err());
    }

    #[test]
    fn test_test_ports_are_per_set() {
        let (mut gw, _) = gateway(BTreeMap::new());
        let first = gw.allocate_test_port().unwrap();
        let second = gw.allocate_test_port().unwrap();
        assert_eq!(first, 1030);
        assert_eq!(second, 1031);
        gw.release_test_port(first);
        assert_eq!(gw.allocate_test_port().unwrap(), 1030);

        for _ in 0..8 {
            gw.allocate_test_port().unwrap();
        }
        assert!(gw.allocate_test_port().is_err());
    }
}
