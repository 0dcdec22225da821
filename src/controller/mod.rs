//! SDN controller events.
//!
//! The controller publishes one JSON object per line. Each object may carry
//! any combination of a port-state change, an L2 learn, and a config change;
//! [`ControllerEvent::decode`] turns it into zero or more tagged events so the
//! runner never inspects raw JSON.

pub mod client;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::monitor::EventSource;

/// Physical or logical switch port number.
pub type Port = u32;

/// Datapath (switch) identifier.
pub type SwitchId = u64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid MAC address: {0:?}")]
    InvalidMac(String),

    #[error("malformed controller event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("controller event source not connected")]
    NotConnected,
}

// ---------------------------------------------------------------------------
// MacAddr
// ---------------------------------------------------------------------------

/// Ethernet address, normalized to lowercase colon-separated hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(String);

impl MacAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddr {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = s.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(ControllerError::InvalidMac(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ControllerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ControllerEvent
// ---------------------------------------------------------------------------

/// A decoded controller event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    PortState {
        switch_id: SwitchId,
        port: Port,
        active: bool,
    },
    PortLearn {
        switch_id: SwitchId,
        port: Port,
        mac: MacAddr,
    },
    ConfigChange {
        switch_id: SwitchId,
        restart_type: String,
    },
    Unknown,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    dp_id: Option<SwitchId>,
    #[serde(rename = "PORT_CHANGE")]
    port_change: Option<RawPortChange>,
    #[serde(rename = "L2_LEARN")]
    l2_learn: Option<RawL2Learn>,
    #[serde(rename = "CONFIG_CHANGE")]
    config_change: Option<RawConfigChange>,
}

#[derive(Debug, Deserialize)]
struct RawPortChange {
    port_no: Port,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    status: bool,
}

#[derive(Debug, Deserialize)]
struct RawL2Learn {
    port_no: Port,
    eth_src: String,
}

#[derive(Debug, Deserialize)]
struct RawConfigChange {
    #[serde(default)]
    restart_type: String,
}

impl ControllerEvent {
    /// Decode one line of the controller stream.
    pub fn decode(line: &str) -> Result<Vec<ControllerEvent>, ControllerError> {
        let raw: RawEvent = serde_json::from_str(line)?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawEvent) -> Vec<ControllerEvent> {
        let Some(switch_id) = raw.dp_id else {
            return vec![ControllerEvent::Unknown];
        };
        let mut events = Vec::new();
        if let Some(change) = raw.port_change {
            events.push(ControllerEvent::PortState {
                switch_id,
                port: change.port_no,
                active: change.status && change.reason != "DELETE",
            });
        }
        if let Some(learn) = raw.l2_learn {
            match learn.eth_src.parse() {
                Ok(mac) => events.push(ControllerEvent::PortLearn {
                    switch_id,
                    port: learn.port_no,
                    mac,
                }),
                Err(e) => warn!(switch_id, port = learn.port_no, error = %e, "ignoring learn event"),
            }
        }
        if let Some(change) = raw.config_change {
            events.push(ControllerEvent::ConfigChange {
                switch_id,
                restart_type: change.restart_type,
            });
        }
        if events.is_empty() {
            events.push(ControllerEvent::Unknown);
        }
        events
    }
}

// ---------------------------------------------------------------------------
// ControllerSource
// ---------------------------------------------------------------------------

/// A connected stream of controller events.
pub trait ControllerSource: EventSource {
    fn connect(&mut self) -> anyhow::Result<()>;

    fn disconnect(&mut self);

    /// Pull the next decoded event without blocking; `None` when nothing
    /// complete is buffered.
    fn next_event(&mut self) -> anyhow::Result<Option<Vec<ControllerEvent>>>;
}
