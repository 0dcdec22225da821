//! DHCP / static-IP readiness protocol.
//!
//! A host becomes eligible once both its IP notification and its DHCP-ready
//! signal have arrived, in either order. A group activates only when every
//! member is eligible and reports itself trigger-ready.

use std::collections::BTreeSet;

use anyhow::Result;
use tracing::{error, info, warn};

use super::{IpInfo, OrchestrationError, Runner};
use crate::controller::MacAddr;
use crate::harness::{IpNotification, GROUP_DELTA_SEC, GROUP_STATE};

/// Outcome of a group-readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    NotReady,
    /// The group is already running; trigger just this host.
    Single,
    /// Activate the gateway and trigger every listed member.
    Group(BTreeSet<MacAddr>),
}

impl Runner {
    /// Handle an IP notification from a gateway.
    pub fn ip_notify(&mut self, notification: IpNotification) -> Result<()> {
        let IpNotification {
            state,
            target,
            gateway_set,
            error,
        } = notification;

        if let Some(error) = error {
            error!(gateway_set, error, "IP exception for gateway set");
            self.terminate_gateway_set(gateway_set);
            return Ok(());
        }

        let Some(target) = target else {
            warn!(gateway_set, "IP target mac missing");
            return Ok(());
        };
        info!(
            mac = %target.mac,
            ip = ?target.ip,
            gateway_set,
            state,
            delta_sec = target.delta_sec,
            "IP notify"
        );

        let mac = target.mac.clone();
        self.target_mac_ip.insert(mac.clone(), target.ip);
        let Some(set) = self.mac_targets.get(&mac).and_then(|port| self.port_targets.get_mut(port)) else {
            return Ok(());
        };
        set.host.ip_notify(target.ip, &state, target.delta_sec);
        self.ip_info.insert(
            mac.clone(),
            IpInfo {
                state,
                target,
                slot: gateway_set,
            },
        );
        self.check_and_activate_gateway(&mac)?;
        Ok(())
    }

    /// Handle a host's DHCP-ready signal.
    pub fn dhcp_ready(&mut self, mac: MacAddr) -> Result<()> {
        if !self.mac_targets.contains_key(&mac) {
            warn!(%mac, "DHCP ready for unknown target");
            return Ok(());
        }
        self.dhcp_ready.insert(mac.clone());
        self.check_and_activate_gateway(&mac)?;
        Ok(())
    }

    fn check_and_activate_gateway(&mut self, mac: &MacAddr) -> Result<(), OrchestrationError> {
        if !self.dhcp_ready.contains(mac) {
            return Ok(());
        }
        let Some(info) = self.ip_info.get(mac).cloned() else {
            return Ok(());
        };
        match self.should_activate_target(mac, info.slot)? {
            Readiness::NotReady => {}
            Readiness::Single => {
                if let Some(set) = self.mac_targets.get(mac).and_then(|port| self.port_targets.get_mut(port)) {
                    set.host.trigger(&info.state, info.target.ip, info.target.delta_sec);
                }
            }
            Readiness::Group(ready) => {
                self.activate_gateway(info.slot, &info.state, &ready, info.target.delta_sec)?;
            }
        }
        Ok(())
    }

    /// Decide whether `mac`'s group can activate now.
    pub fn should_activate_target(&mut self, mac: &MacAddr, slot: usize) -> Result<Readiness, OrchestrationError> {
        let Some(&port) = self.mac_targets.get(mac) else {
            warn!(%mac, "DHCP target missing");
            return Ok(Readiness::NotReady);
        };
        let entry = self
            .gateways
            .get_mut(slot)
            .ok_or(OrchestrationError::UnknownGatewaySet(slot))?;

        if entry.gateway.activated() {
            info!(group = %entry.group, "DHCP activation group already activated");
            return Ok(Readiness::Single);
        }

        let set = self
            .port_targets
            .get_mut(&port)
            .ok_or(OrchestrationError::MissingTarget(port))?;
        if !set.host.notify_activate() {
            info!(%mac, "DHCP device ignoring spurious notify");
            return Ok(Readiness::NotReady);
        }

        let ready = entry.gateway.target_ready(mac);
        let group_size = self.topology.device_group_size(&entry.group);
        let remaining = group_size.saturating_sub(ready.len());
        if remaining > 0 && self.state.run_tests() {
            info!(remaining, group = %entry.group, "DHCP waiting for additional group members");
            return Ok(Readiness::NotReady);
        }

        let all_ready = ready.iter().all(|member| {
            self.mac_targets
                .get(member)
                .and_then(|port| self.port_targets.get(port))
                .is_some_and(|set| set.host.trigger_ready())
        });
        if !all_ready {
            info!(group = %entry.group, "DHCP device group not ready to trigger");
            return Ok(Readiness::NotReady);
        }
        Ok(Readiness::Group(ready))
    }

    fn activate_gateway(
        &mut self,
        slot: usize,
        state: &str,
        ready: &BTreeSet<MacAddr>,
        delta_sec: i64,
    ) -> Result<(), OrchestrationError> {
        let entry = self
            .gateways
            .get_mut(slot)
            .ok_or(OrchestrationError::UnknownGatewaySet(slot))?;
        entry.gateway.activate();

        let (state, delta_sec) = if ready.len() > 1 {
            (GROUP_STATE, GROUP_DELTA_SEC)
        } else {
            (state, delta_sec)
        };
        for mac in ready {
            info!(%mac, "IP activating target");
            let ip = self.target_mac_ip.get(mac).copied().flatten();
            let set = self.mac_targets.get(mac).and_then(|port| self.port_targets.get_mut(port));
            let Some(set) = set else {
                panic!("ready host {mac} has no target set");
            };
            let triggered = set.host.trigger(state, ip, delta_sec);
            assert!(triggered, "host {mac} not triggered");
        }
        Ok(())
    }
}
