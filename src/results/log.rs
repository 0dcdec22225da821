//! Append-only result log: one line per finalized port, flushed after every
//! write so an abrupt exit loses nothing already finalized.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::controller::Port;

pub struct ResultLog {
    path: PathBuf,
    writer: File,
}

impl ResultLog {
    /// Open (or create) the result log at `path` in append mode.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create result log directory: {}", parent.display()))?;
        }
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open result log: {}", path.display()))?;
        debug!(path = %path.display(), "result log opened");
        Ok(Self { path, writer })
    }

    /// Append `"<port>: [<tokens>]"`.
    pub fn write(&mut self, port: Port, tokens: &[String]) -> Result<()> {
        let line = format!("{:02}: [{}]\n", port, tokens.join(", "));
        self.writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write to result log: {}", self.path.display()))?;
        self.writer
            .flush()
            .with_context(|| format!("failed to flush result log: {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_appended() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("inst/result.log");

        {
            let mut log = ResultLog::open(&path).unwrap();
            log.write(3, &[]).unwrap();
            log.write(12, &["12:ping:1".to_string(), "12:nmap:boom".to_string()])
                .unwrap();
        }
        {
            let mut log = ResultLog::open(&path).unwrap();
            assert_eq!(log.path(), path.as_path());
            log.write(4, &["04:terminated:terminated".to_string()]).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "03: []",
                "12: [12:ping:1, 12:nmap:boom]",
                "04: [04:terminated:terminated]"
            ]
        );
    }
}
