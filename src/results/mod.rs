//! Per-target outcome records, the append-only result log, and the run verdict.

mod log;

pub use log::ResultLog;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::controller::Port;

/// Sub-result name whose code is inverted: a zero code means the expected
/// failure did not happen.
const INVERTED_RESULT: &str = "fail";

/// Outcome of one sub-test of a target set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl ResultRecord {
    pub fn with_code(code: i64) -> Self {
        Self {
            code: Some(code),
            ..Self::default()
        }
    }

    pub fn with_exception(message: impl Into<String>) -> Self {
        Self {
            exception: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Status token for this record, or `None` when it passed.
    fn status(&self, name: &str) -> Option<String> {
        if let Some(exception) = &self.exception {
            return Some(exception.clone());
        }
        let code = self.code.unwrap_or(0);
        let status = if name == INVERTED_RESULT {
            i64::from(code == 0)
        } else {
            code
        };
        (status != 0).then(|| status.to_string())
    }
}

/// Sub-results of one target set, keyed by sub-result name.
pub type ResultSet = BTreeMap<String, ResultRecord>;

/// Render the non-passing entries of `results` as `"<port>:<name>:<status>"`
/// tokens, in key order.
pub fn combine_result_set(port: Port, results: &ResultSet) -> Vec<String> {
    results
        .iter()
        .filter_map(|(key, record)| {
            let name = record.name.as_deref().unwrap_or(key);
            record
                .status(name)
                .map(|status| format!("{:02}:{}:{}", port, name, status))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ResultAggregator
// ---------------------------------------------------------------------------

/// Latest finalized result set per port.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    sets: BTreeMap<Port, ResultSet>,
}

impl ResultAggregator {
    pub fn record(&mut self, port: Port, results: ResultSet) {
        self.sets.insert(port, results);
    }

    pub fn get(&self, port: Port) -> Option<&ResultSet> {
        self.sets.get(&port)
    }

    /// Failure tokens across every finalized port.
    pub fn failures(&self) -> Vec<String> {
        self.sets
            .iter()
            .flat_map(|(port, set)| combine_result_set(*port, set))
            .collect()
    }

    /// Process exit code: 0 when nothing failed and no loop-level error was
    /// recorded, 1 otherwise.
    pub fn exit_code(&self, exception: Option<&str>) -> i32 {
        let failures = self.failures();
        if !failures.is_empty() {
            error!(?failures, "test failures");
        }
        if let Some(exception) = exception {
            error!(exception, "exiting because of exception");
        }
        if failures.is_empty() && exception.is_none() {
            0
        } else {
            1
        }
    }
}
