//! Local implementations of the harness interfaces, used by the binary.

mod gateway;
mod host;
mod topology;

pub use gateway::LocalGateway;
pub use host::CommandHost;
pub use topology::StaticTopology;

use anyhow::Result;
use tracing::info;

use crate::config::HarnessConfig;
use crate::controller::Port;
use crate::harness::{Gateway, HarnessFactory, IpListener, TargetHost, TargetInfo};

/// Builds [`CommandHost`]s and [`LocalGateway`]s from the `[harness]` config.
pub struct LocalFactory {
    harness: HarnessConfig,
    tests: Vec<String>,
}

impl LocalFactory {
    pub fn new(harness: HarnessConfig, tests: Vec<String>) -> Self {
        Self { harness, tests }
    }
}

impl HarnessFactory for LocalFactory {
    fn create_host(&mut self, target: &TargetInfo) -> Result<Box<dyn TargetHost>> {
        Ok(Box::new(CommandHost::new(
            target.clone(),
            self.harness.command.clone(),
            self.tests.clone(),
        )))
    }

    fn create_gateway(&mut self, group: &str, slot: usize, ip_listener: IpListener) -> Result<Box<dyn Gateway>> {
        Ok(Box::new(LocalGateway::new(
            group,
            slot,
            self.harness.static_ips.clone(),
            ip_listener,
        )))
    }

    fn clear_port(&mut self, port: Port) {
        info!(port, "clearing port");
    }
}
