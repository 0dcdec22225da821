//! Port activation table and controller event translation.

use anyhow::Result;
use tracing::{debug, info, warn};

use super::Runner;
use crate::controller::{ControllerEvent, MacAddr, Port, SwitchId};

/// Termination reason for a target set whose port went down.
const PORT_DOWN: &str = "port not active";

/// Recorded state of an active device port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortState {
    /// Link is up, nothing learned yet.
    Unlearned,
    Learned(MacAddr),
}

impl PortState {
    pub fn mac(&self) -> Option<&MacAddr> {
        match self {
            PortState::Unlearned => None,
            PortState::Learned(mac) => Some(mac),
        }
    }
}

impl Runner {
    /// Pull and handle every complete controller event currently buffered.
    pub(super) fn handle_controller_events(&mut self) -> Result<()> {
        loop {
            let Some(controller) = self.controller.as_mut() else {
                return Ok(());
            };
            let Some(events) = controller.next_event()? else {
                return Ok(());
            };
            for event in events {
                self.handle_controller_event(event);
            }
        }
    }

    /// Discard everything the controller has already queued.
    pub(super) fn flush_controller_events(&mut self) {
        info!("flushing controller event queue");
        let Some(controller) = self.controller.as_mut() else {
            return;
        };
        let mut flushed = 0usize;
        loop {
            match controller.next_event() {
                Ok(Some(_)) => flushed += 1,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "stopped flushing controller events");
                    break;
                }
            }
        }
        debug!(flushed, "controller events flushed");
    }

    /// Apply one decoded controller event.
    pub fn handle_controller_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::PortState {
                switch_id,
                port,
                active,
            } => {
                debug!(switch_id, port, active, "port state");
                self.handle_port_state(switch_id, port, active);
            }
            ControllerEvent::PortLearn {
                switch_id,
                port,
                mac,
            } => self.handle_port_learn(switch_id, port, mac),
            ControllerEvent::ConfigChange {
                switch_id,
                restart_type,
            } => debug!(switch_id, restart_type, "controller config change"),
            ControllerEvent::Unknown => {}
        }
    }

    fn handle_port_state(&mut self, switch_id: SwitchId, port: Port, active: bool) {
        if self.topology.is_system_port(switch_id, port) {
            info!(switch_id, port, active, "system port state");
            self.system_active = active;
            return;
        }
        if !self.topology.is_device_port(switch_id, port) {
            debug!(switch_id, port, active, "unknown port state");
            return;
        }

        if active != self.active_ports.contains_key(&port) {
            info!(switch_id, port, active, "port is now active");
            if active {
                self.factory.clear_port(port);
            }
        }

        if active {
            self.active_ports.entry(port).or_insert(PortState::Unlearned);
            return;
        }

        if let Some(set) = self.port_targets.get_mut(&port) {
            // A port dropping mid-test is a failure of the running test.
            let test_name = set.host.test_name();
            set.host.record_result(&test_name, Some(PORT_DOWN.to_string()));
            self.target_set_complete(port, PORT_DOWN);
        }
        if let Some(PortState::Learned(mac)) = self.active_ports.remove(&port) {
            self.topology.direct_port_traffic(&mac, port, None);
        }
    }

    fn handle_port_learn(&mut self, switch_id: SwitchId, port: Port, mac: MacAddr) {
        if !self.topology.is_device_port(switch_id, port) {
            debug!(switch_id, port, %mac, "non-device port learned");
            return;
        }
        info!(switch_id, port, %mac, "port learned");
        self.active_ports.insert(port, PortState::Learned(mac));
        self.trigger_port(port);
    }
}
