//! Idle sweep, loop hook, and shutdown.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use super::{LingerExit, LostSignal, OrchestrationError, PortState, Runner};
use crate::controller::Port;
use crate::monitor::Registry;

impl Runner {
    /// Idle handler: runs whenever a non-blocking poll finds nothing ready.
    pub fn handle_system_idle(&mut self, registry: &mut Registry<Runner>) -> Result<()> {
        // Events decoded alongside an earlier line may still be buffered.
        if let Err(e) = self.handle_controller_events() {
            warn!(error = %format!("{e:#}"), "failed to drain controller events");
        }

        let mut all_idle = true;
        let ports: Vec<Port> = self.port_targets.keys().copied().collect();
        for port in ports {
            let Some(set) = self.port_targets.get_mut(&port) else {
                continue;
            };
            if set.host.is_running() {
                all_idle = false;
                if let Err(e) = set.host.idle_handler() {
                    self.target_error(port, e);
                }
            } else {
                self.target_set_complete(port, "target set not active");
            }
        }

        if !self.stopping.is_empty() {
            self.sweep_stopping();
            all_idle = false;
        }

        if !self.state.event_trigger {
            let learned: Vec<Port> = self
                .active_ports
                .iter()
                .filter(|(_, state)| matches!(state, PortState::Learned(_)))
                .map(|(port, _)| *port)
                .collect();
            for port in learned {
                self.trigger_port(port);
                all_idle = false;
            }
        }

        if self.port_targets.is_empty() && self.stopping.is_empty() && !self.state.run_tests() {
            if self.state.linger_exit == LingerExit::Armed {
                self.state.linger_exit = LingerExit::Delivered;
                warn!("result linger on exit");
            } else if self.controller.is_some() {
                self.shutdown(registry)?;
            }
            all_idle = false;
        }

        if all_idle {
            debug!("no active device ports, waiting for trigger event");
        }
        Ok(())
    }

    /// Release the controller channel so the loop can drain and exit.
    pub fn shutdown(&mut self, registry: &mut Registry<Runner>) -> Result<()> {
        self.active_ports.clear();
        if let Some(mut controller) = self.controller.take() {
            if registry.is_monitored(controller.descriptor()) {
                registry.forget(&*controller)?;
            }
            controller.disconnect();
        }
        let count = registry.log_monitors();
        warn!(monitors = count, "no active ports remaining, ending test run");
        Ok(())
    }

    /// Per-pass hook: run queued cross-thread work and log target states.
    pub fn loop_hook(&mut self) {
        self.run_queued();
        let states: BTreeMap<Port, String> = self
            .port_targets
            .iter()
            .map(|(port, set)| (*port, set.host.state()))
            .collect();
        debug!(?states, "active target sets");
    }

    /// Run every queued callback on this thread; returns how many ran.
    pub fn run_queued(&mut self) -> usize {
        let queue = self.queue.clone();
        let (count, errors) = queue.drain_into(self);
        for e in errors {
            error!(error = %format!("{e:#}"), "queued callback failed");
        }
        self.replay_lost_signals();
        count
    }

    /// Fail the targets whose readiness signal never made it into the queue.
    fn replay_lost_signals(&mut self) {
        for signal in self.lost_signals.take() {
            match signal {
                LostSignal::DhcpReady(mac) | LostSignal::Ip { mac: Some(mac), .. } => {
                    match self.mac_targets.get(&mac).copied() {
                        Some(port) => self.target_error(port, OrchestrationError::SignalDropped { mac }.into()),
                        None => debug!(%mac, "dropped signal for departed target"),
                    }
                }
                LostSignal::Ip { mac: None, slot } => self.terminate_gateway_set(slot),
            }
        }
    }

    /// Poll cancelled hosts and release the ones that have exited.
    fn sweep_stopping(&mut self) {
        self.stopping.retain_mut(|(port, host)| {
            if let Err(e) = host.idle_handler() {
                warn!(port = *port, error = %format!("{e:#}"), "stopping host idle error");
            }
            let running = host.is_running();
            if !running {
                info!(port = *port, "target host stopped");
            }
            running
        });
    }

    /// Heartbeat every live host after a quiet poll interval.
    pub(super) fn module_heartbeat(&mut self) {
        for set in self.port_targets.values_mut() {
            set.host.heartbeat();
        }
    }

    /// Ask every remaining target set to stop.
    pub(super) fn terminate_all(&mut self) {
        for (port, set) in self.port_targets.iter_mut() {
            info!(port, "terminating target set on exit");
            set.host.terminate("runner exit", true);
        }
    }

    pub(super) fn controller_hangup(&mut self) {
        warn!("controller event channel closed");
        self.exception = Some("controller event channel closed".to_string());
        self.state.suppress_tests("controller disconnected");
        if let Some(mut controller) = self.controller.take() {
            controller.disconnect();
        }
    }

    pub(super) fn controller_error(&mut self, err: anyhow::Error) {
        error!(error = %format!("{err:#}"), "controller event channel failed");
        self.exception = Some(format!("{err:#}"));
        self.state.suppress_tests("controller failed");
        if let Some(mut controller) = self.controller.take() {
            controller.disconnect();
        }
    }
}
