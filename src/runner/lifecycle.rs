//! Target-set creation, completion, cancellation, and error finalization.

use anyhow::Result;
use tracing::{debug, error, info, warn};

use super::{LingerExit, LostSignal, PortState, Runner, TargetSet};
use crate::controller::Port;
use crate::harness::TargetInfo;
use crate::results::{combine_result_set, ResultRecord, ResultSet};

/// Gateway script that holds back DHCP responses for a MAC.
const DHCP_RESPONSE_SCRIPT: &str = "change_dhcp_response_time";

/// Result key used when an error hits a port with no target set.
const EXCEPTION_RESULT: &str = "exception";

impl Runner {
    /// Try to start a test session on a learned port.
    ///
    /// Returns `false` without side effects when the port is not learned,
    /// already has a target set, the system port is down, or testing has
    /// been suppressed.
    pub fn trigger_port(&mut self, port: Port) -> bool {
        let Some(mac) = self.active_ports.get(&port).and_then(PortState::mac).cloned() else {
            debug!(port, "target port triggered but not learned");
            return false;
        };
        if !self.system_active {
            warn!(port, "target port ignored, system not active");
            return false;
        }
        if self.port_targets.contains_key(&port) {
            debug!(port, "target port already active");
            return false;
        }
        if !self.state.run_tests() {
            debug!(port, "target port trigger ignored");
            return false;
        }

        let group = self.topology.device_group_for(&mac);
        let slot = match self.activate_device_group(&group, port) {
            Ok(slot) => slot,
            Err(e) => {
                error!(port, error = %e, "target port trigger error");
                if self.state.fail_mode {
                    self.state.suppress_tests("target trigger failed in fail mode");
                }
                return false;
            }
        };
        let Some(entry) = self.gateways.get(slot) else {
            return false;
        };
        if entry.gateway.activated() {
            debug!(port, group, "target port trigger ignored, gateway already activated");
            return false;
        }

        let target = TargetInfo {
            port,
            group,
            fake: entry.gateway.fake_target(),
            port_set: entry.gateway.port_set(),
            mac,
        };
        match self.create_target_set(slot, target) {
            Ok(()) => true,
            Err(e) => {
                self.target_error(port, e);
                false
            }
        }
    }

    fn create_target_set(&mut self, slot: usize, target: TargetInfo) -> Result<()> {
        let port = target.port;
        let mac = target.mac.clone();
        // Bound first so a failure below still detaches and retires the gateway.
        self.port_gateways.insert(port, slot);
        if let Some(entry) = self.gateways.get_mut(slot) {
            // No DHCP responses until the host asks for its address.
            entry.gateway.execute_script(DHCP_RESPONSE_SCRIPT, &mac, -1)?;
            entry.gateway.attach_target(port, target.clone());
        }

        self.state.run_count += 1;
        let mut host = self.factory.create_host(&target)?;
        let queue = self.queue.clone();
        let lost = self.lost_signals.clone();
        let ready_mac = mac.clone();
        host.register_dhcp_ready_listener(Box::new(move || {
            let mac = ready_mac.clone();
            if let Err(e) = queue.push(move |runner: &mut Runner| runner.dhcp_ready(mac)) {
                error!(error = %e, mac = %ready_mac, "dropping DHCP ready signal");
                lost.record(LostSignal::DhcpReady(ready_mac.clone()));
            }
        }));

        self.mac_targets.insert(mac.clone(), port);
        self.port_targets.insert(
            port,
            TargetSet {
                mac: mac.clone(),
                host,
            },
        );
        info!(port, %mac, "target port registered");

        if let Some(set) = self.port_targets.get_mut(&port) {
            set.host.initialize()?;
        }
        self.topology.direct_port_traffic(&mac, port, Some(&target));
        self.send_heartbeat();
        Ok(())
    }

    /// Handle a failure on `port`, whether or not it has a target set yet.
    pub fn target_error(&mut self, port: Port, err: anyhow::Error) {
        let active = self.port_targets.contains_key(&port);
        error!(port, active, error = %format!("{err:#}"), "target port exception");
        self.detach_gateway(port);

        let message = err.to_string();
        if let Some(set) = self.port_targets.get_mut(&port) {
            let test_name = set.host.test_name();
            set.host.record_result(&test_name, Some(message.clone()));
            self.target_set_complete(port, &message);
        } else {
            let mut results = ResultSet::new();
            results.insert(
                EXCEPTION_RESULT.to_string(),
                ResultRecord::with_exception(format!("{err:#}")),
            );
            self.finalize_target_set(port, results, &message);
        }
    }

    /// Finalize and tear down the target set on `port`.
    pub fn target_set_complete(&mut self, port: Port, reason: &str) {
        let Some(set) = self.port_targets.get(&port) else {
            warn!(port, reason, "no target set to complete");
            return;
        };
        let results = set.host.results().clone();
        self.finalize_target_set(port, results, reason);
        self.cancel(port, reason);
    }

    /// Log `results` for `port` and apply the failure policies.
    pub(super) fn finalize_target_set(&mut self, port: Port, results: ResultSet, reason: &str) {
        let tokens = combine_result_set(port, &results);
        info!(port, ?tokens, reason, "target port finalize");
        if let Some(log) = self.result_log.as_mut() {
            if let Err(e) = log.write(port, &tokens) {
                error!(port, error = %format!("{e:#}"), "failed to record result");
            }
        }

        if !tokens.is_empty() && (self.state.fail_mode || self.state.result_linger) {
            self.state.suppress_tests("target failed");
            if self.state.result_linger {
                self.state.linger_exit = LingerExit::Armed;
            }
        }
        self.results.record(port, results);
    }

    /// Remove the target set on `port`, lingering or tearing down its
    /// resources. A port without a target set is left alone.
    pub fn cancel(&mut self, port: Port, reason: &str) {
        if let Some(mut set) = self.port_targets.remove(&port) {
            let mac = set.mac.clone();
            self.mac_targets.remove(&mac);
            self.dhcp_ready.remove(&mac);
            self.ip_info.remove(&mac);
            let slot = self.port_gateways.get(&port).copied();
            info!(
                port,
                %mac,
                run_count = self.state.run_count,
                run_limit = self.state.run_limit,
                "target port cancel"
            );

            let failed = self
                .results
                .get(port)
                .is_some_and(|results| !combine_result_set(port, results).is_empty());
            let result_linger = failed && self.state.result_linger;
            let gateway = slot.and_then(|slot| self.gateways.get_mut(slot));
            let gateway_linger = gateway.as_ref().is_some_and(|e| e.gateway.result_linger());

            if result_linger || gateway_linger {
                warn!(port, "target port result linger");
                self.active_ports.insert(port, PortState::Unlearned);
                if let Some(entry) = gateway {
                    entry.gateway.set_result_linger(true);
                }
            } else {
                self.topology.direct_port_traffic(&mac, port, None);
                set.host.terminate(reason, false);
                if slot.is_some() {
                    self.detach_gateway(port);
                }
                if set.host.is_running() {
                    debug!(port, "target host still stopping");
                    self.stopping.push((port, set.host));
                }
            }

            let state = &mut self.state;
            if state.run_limit > 0 && state.run_count >= state.run_limit {
                state.suppress_tests("run limit reached");
            }
            if state.single_shot {
                state.suppress_tests("test done in single shot");
            }
        }
        info!(remaining = ?self.target_ports(), "remaining target sets");
    }
}
