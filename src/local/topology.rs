//! Topology policy backed by the static `[topology]` config section.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::config::TopologyConfig;
use crate::controller::{MacAddr, Port, SwitchId};
use crate::harness::{TargetInfo, TopologyPolicy};

pub struct StaticTopology {
    switch_id: SwitchId,
    system_port: Port,
    device_ports: BTreeSet<Port>,
    groups: BTreeMap<MacAddr, String>,
    /// Ports currently steered through the test path.
    routes: BTreeMap<Port, MacAddr>,
}

impl StaticTopology {
    pub fn new(config: &TopologyConfig) -> Self {
        Self {
            switch_id: config.switch_id,
            system_port: config.system_port,
            device_ports: config.device_ports.iter().copied().collect(),
            groups: config.groups.clone(),
            routes: BTreeMap::new(),
        }
    }

    /// MAC currently routed through the test path on `port`.
    pub fn route(&self, port: Port) -> Option<&MacAddr> {
        self.routes.get(&port)
    }
}

impl TopologyPolicy for StaticTopology {
    fn initialize(&mut self) -> anyhow::Result<()> {
        info!(
            switch_id = self.switch_id,
            system_port = self.system_port,
            device_ports = ?self.device_ports,
            groups = self.groups.len(),
            "static topology"
        );
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.routes.clear();
        Ok(())
    }

    fn device_group_for(&self, mac: &MacAddr) -> String {
        self.groups
            .get(mac)
            .cloned()
            .unwrap_or_else(|| mac.to_string())
    }

    fn device_group_size(&self, group: &str) -> usize {
        self.groups.values().filter(|g| *g == group).count().max(1)
    }

    fn is_system_port(&self, switch_id: SwitchId, port: Port) -> bool {
        switch_id == self.switch_id && port == self.system_port
    }

    fn is_device_port(&self, switch_id: SwitchId, port: Port) -> bool {
        switch_id == self.switch_id && self.device_ports.contains(&port)
    }

    fn direct_port_traffic(&mut self, mac: &MacAddr, port: Port, target: Option<&TargetInfo>) {
        match target {
            Some(target) => {
                debug!(port, %mac, port_set = target.port_set, "directing traffic to test path");
                self.routes.insert(port, mac.clone());
            }
            None => {
                debug!(port, %mac, "directing traffic to default path");
                self.routes.remove(&port);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    fn topology() -> StaticTopology {
        let mut config = TopologyConfig {
            switch_id: 2,
            system_port: 48,
            device_ports: vec![1, 2, 3],
            ..TopologyConfig::default()
        };
        config.groups.insert(mac("02:00:00:00:00:01"), "pair".to_string());
        config.groups.insert(mac("02:00:00:00:00:02"), "pair".to_string());
        StaticTopology::new(&config)
    }

    #[test]
    fn test_groups_and_sizes() {
        let topo = topology();
        assert_eq!(topo.device_group_for(&mac("02:00:00:00:00:01")), "pair");
        assert_eq!(topo.device_group_size("pair"), 2);

        let loner = mac("02:00:00:00:00:09");
        let group = topo.device_group_for(&loner);
        assert_eq!(group, "02:00:00:00:00:09");
        assert_eq!(topo.device_group_size(&group), 1);
    }

    #[test]
    fn test_port_classification() {
        let topo = topology();
        assert!(topo.is_system_port(2, 48));
        assert!(!topo.is_system_port(1, 48));
        assert!(topo.is_device_port(2, 3));
        assert!(!topo.is_device_port(2, 4));
        assert!(!topo.is_device_port(1, 3));
    }

    #[test]
    fn test_routes_follow_direction() {
        let mut topo = topology();
        let m = mac("02:00:00:00:00:01");
        let target = TargetInfo {
            port: 1,
            group: "pair".to_string(),
            fake: false,
            port_set: 1,
            mac: m.clone(),
        };
        topo.direct_port_traffic(&m, 1, Some(&target));
        assert_eq!(topo.route(1), Some(&m));
        topo.direct_port_traffic(&m, 1, None);
        assert!(topo.route(1).is_none());
    }
}
