//! qualrig -- automated qualification testing of network-attached devices.
//!
//! This crate provides the orchestration engine: a poll-driven event
//! multiplexer, controller event decoding, and the port / gateway / target-set
//! lifecycle that turns learned devices into running test sessions.

pub mod config;
pub mod controller;
pub mod harness;
pub mod local;
pub mod monitor;
pub mod queue;
pub mod results;
pub mod runner;
pub mod telemetry;
pub mod testlist;
pub mod watcher;

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::QualrigConfig;
use crate::controller::client::EventClient;
use crate::local::{LocalFactory, StaticTopology};
use crate::runner::{Collaborators, Runner};
use crate::telemetry::{JsonLinesTelemetry, NullTelemetry, Telemetry};
use crate::watcher::ConfigWatcher;

/// How often the base config file is checked for changes.
const BASE_CONFIG_POLL: Duration = Duration::from_secs(5);

/// Run a full qualification session and return the process exit code.
pub fn run(config: &QualrigConfig) -> Result<i32> {
    config.validate()?;
    let tests = testlist::resolve(config)?;

    let base_config = match &config.paths.base_config {
        Some(path) => watcher::read_config(path)?,
        None => serde_json::Value::Object(serde_json::Map::new()),
    };
    let telemetry: Box<dyn Telemetry> = match &config.paths.telemetry_log {
        Some(path) => Box::new(JsonLinesTelemetry::open(path)?),
        None => Box::new(NullTelemetry),
    };
    let collaborators = Collaborators {
        topology: Box::new(StaticTopology::new(&config.topology)),
        factory: Box::new(LocalFactory::new(config.harness.clone(), tests.clone())),
        telemetry,
        controller: Box::new(EventClient::new(&config.controller.socket_path)),
    };

    let mut runner = Runner::new(config, tests, base_config, collaborators)?;
    if let Err(e) = runner.initialize() {
        runner.cleanup();
        return Err(e);
    }

    let _watcher = match &config.paths.base_config {
        Some(path) => {
            let queue = runner.queue_handle();
            Some(ConfigWatcher::spawn(path.clone(), BASE_CONFIG_POLL, move |value| {
                let pushed = queue.push(move |runner: &mut Runner| {
                    runner.base_config_changed(value);
                    Ok(())
                });
                if let Err(e) = pushed {
                    warn!(error = %e, "dropping base config change");
                }
            })?)
        }
        None => None,
    };

    runner.main_loop();
    runner.cleanup();
    let code = runner.finalize();
    info!(code, "qualification run finished");
    Ok(code)
}
