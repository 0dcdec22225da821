//! Host test-list files.
//!
//! A test list is a line-oriented file of commands:
//!
//! ```text
//! # comment
//! include base.conf   # relative to the including file
//! add ping
//! remove nmap
//! build               # accepted, ignored
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::QualrigConfig;

/// Test appended when `keep_hold` is set.
pub const HOLD_TEST: &str = "hold";

/// Nesting limit for `include`, which also catches include cycles.
const MAX_INCLUDE_DEPTH: usize = 16;

/// Load the test list at `path`.
pub fn load(path: &Path) -> Result<Vec<String>> {
    let mut tests = Vec::new();
    load_into(path, &mut tests, 0)?;
    Ok(tests)
}

/// Resolve the configured test sequence, honoring `no_test` and `keep_hold`.
pub fn resolve(config: &QualrigConfig) -> Result<Vec<String>> {
    let mut tests = if config.runner.no_test {
        warn!("suppressing configured tests because no_test is set");
        Vec::new()
    } else {
        load(&config.paths.host_tests)?
    };
    if config.runner.keep_hold {
        info!("appending hold to master test list");
        tests.push(HOLD_TEST.to_string());
    }
    info!(tests = %tests.join(", "), "configured test list");
    Ok(tests)
}

fn load_into(path: &Path, tests: &mut Vec<String>, depth: usize) -> Result<()> {
    anyhow::ensure!(
        depth < MAX_INCLUDE_DEPTH,
        "test list include depth exceeded at {}",
        path.display()
    );
    info!(path = %path.display(), "reading test definition file");
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read test list: {}", path.display()))?;

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("");
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let argument = words.next();
        match (command, argument) {
            ("add", Some(test)) => {
                debug!(test, path = %path.display(), "adding test");
                tests.push(test.to_string());
            }
            ("remove", Some(test)) => {
                if let Some(pos) = tests.iter().position(|t| t == test) {
                    debug!(test, path = %path.display(), "removing test");
                    tests.remove(pos);
                }
            }
            ("include", Some(file)) => {
                let included = include_path(path, file);
                load_into(&included, tests, depth + 1)?;
            }
            ("build", _) => {}
            _ => warn!(
                path = %path.display(),
                line = lineno + 1,
                command,
                "unknown test list command"
            ),
        }
    }
    Ok(())
}

fn include_path(from: &Path, file: &str) -> PathBuf {
    let file = Path::new(file);
    if file.is_absolute() {
        return file.to_path_buf();
    }
    from.parent()
        .map(|dir| dir.join(file))
        .unwrap_or_else(|| file.to_path_buf())
}
