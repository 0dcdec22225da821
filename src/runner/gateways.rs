//! Gateway slot arena and device-group activation.

use tracing::{debug, error, info, warn};

use super::{LostSignal, OrchestrationError, Runner};
use crate::controller::Port;
use crate::harness::{Gateway, IpNotification};

/// A device group bound to its gateway.
pub struct GatewayEntry {
    pub group: String,
    pub gateway: Box<dyn Gateway>,
}

/// Fixed-size pool of gateway slots.
///
/// Slot 0 is never handed out by the free-slot scan; it stays available only
/// when a port numbered 0 asks for it by preference.
pub struct GatewaySlots {
    slots: Vec<Option<GatewayEntry>>,
}

impl GatewaySlots {
    pub fn new(max: usize) -> Self {
        Self {
            slots: (0..max).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_free(&self, slot: usize) -> bool {
        matches!(self.slots.get(slot), Some(None))
    }

    /// Pick a slot for `port`: the port number itself when it is a free
    /// slot, otherwise the lowest free slot from 1.
    pub fn find_free(&self, port: Port) -> Result<usize, OrchestrationError> {
        let preferred = port as usize;
        if self.is_free(preferred) {
            return Ok(preferred);
        }
        (1..self.slots.len())
            .find(|&slot| self.is_free(slot))
            .ok_or(OrchestrationError::SlotsExhausted {
                max: self.slots.len(),
            })
    }

    pub fn insert(&mut self, slot: usize, entry: GatewayEntry) {
        assert!(self.is_free(slot), "gateway set {slot} already bound");
        self.slots[slot] = Some(entry);
    }

    pub fn remove(&mut self, slot: usize) -> Option<GatewayEntry> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn get(&self, slot: usize) -> Option<&GatewayEntry> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut GatewayEntry> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Bound slots and their group names, in slot order.
    pub fn bound(&self) -> Vec<(usize, &str)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|e| (slot, e.group.as_str())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Runner {
    /// Return the slot of the gateway serving `group`, creating and
    /// initializing one if the group has none yet.
    pub(super) fn activate_device_group(&mut self, group: &str, port: Port) -> Result<usize, OrchestrationError> {
        if let Some(&slot) = self.device_groups.get(group) {
            debug!(group, slot, "gateway for existing device group");
            return Ok(slot);
        }
        let slot = self.gateways.find_free(port)?;
        info!(group, slot, "gateway for device group not found, initializing");

        let queue = self.queue.clone();
        let lost = self.lost_signals.clone();
        let listener = Box::new(move |notification: IpNotification| {
            let signal = LostSignal::Ip {
                mac: notification.target.as_ref().map(|t| t.mac.clone()),
                slot: notification.gateway_set,
            };
            let pushed = queue.push(move |runner: &mut Runner| runner.ip_notify(notification));
            if let Err(e) = pushed {
                error!(error = %e, ?signal, "dropping ip notification");
                lost.record(signal);
            }
        });
        let gateway = self
            .factory
            .create_gateway(group, slot, listener)
            .map_err(|e| OrchestrationError::GatewayInit {
                group: group.to_string(),
                slot,
                source: e.into(),
            })?;

        self.gateways.insert(
            slot,
            GatewayEntry {
                group: group.to_string(),
                gateway,
            },
        );
        self.device_groups.insert(group.to_string(), slot);

        let initialized = match self.gateways.get_mut(slot) {
            Some(entry) => entry.gateway.initialize(),
            None => Ok(()),
        };
        if let Err(e) = initialized {
            error!(group, slot, port, "cleaning up from failed gateway initialization");
            self.gateways.remove(slot);
            self.device_groups.remove(group);
            return Err(OrchestrationError::GatewayInit {
                group: group.to_string(),
                slot,
                source: e.into(),
            });
        }
        Ok(slot)
    }

    /// Unbind `port` from its gateway, retiring the gateway when it was the
    /// last target and the gateway is not lingering.
    pub(super) fn detach_gateway(&mut self, port: Port) {
        let Some(slot) = self.port_gateways.remove(&port) else {
            return;
        };
        let Some(entry) = self.gateways.get_mut(slot) else {
            warn!(port, slot, "port bound to an empty gateway set");
            return;
        };
        if entry.gateway.detach_target(port) {
            return;
        }
        if entry.gateway.result_linger() {
            warn!(port, slot, group = %entry.group, "keeping lingering gateway");
            return;
        }
        if let Some(mut entry) = self.gateways.remove(slot) {
            info!(
                port,
                slot,
                gateway = entry.gateway.name(),
                group = %entry.group,
                "retiring target gateway"
            );
            self.device_groups.remove(&entry.group);
            entry.gateway.terminate();
        }
    }

    /// Terminate every target set attached to the gateway in `slot`.
    pub fn terminate_gateway_set(&mut self, slot: usize) {
        let Some(entry) = self.gateways.get(slot) else {
            warn!(slot, bound = ?self.gateways.bound(), "gateway set not found");
            return;
        };
        let ports: Vec<Port> = entry.gateway.targets().iter().map(|t| t.port).collect();
        info!(group = %entry.group, slot, ?ports, "terminating gateway group");
        for port in ports {
            if let Some(set) = self.port_targets.get_mut(&port) {
                set.host.terminate("gateway terminate", true);
            }
            self.target_error(port, OrchestrationError::Terminated.into());
        }
    }
}
