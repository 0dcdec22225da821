//! Background watcher for the base configuration file.
//!
//! Runs a small current-thread tokio runtime on its own OS thread and polls
//! the file's metadata. Each change is parsed and handed to a callback, which
//! is expected to queue the work for the loop thread rather than act on it.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Parse a TOML config file into a JSON value for publishing.
pub fn read_config(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read base config: {}", path.display()))?;
    let value: toml::Value = toml::from_str(&content)
        .with_context(|| format!("failed to parse base config: {}", path.display()))?;
    serde_json::to_value(value).context("failed to convert base config")
}

type Stamp = Option<(SystemTime, u64)>;

fn stamp(path: &Path) -> Stamp {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

/// Poll `path` every `period` until `stop` flips or its sender goes away.
pub async fn watch_file<F>(path: PathBuf, period: Duration, mut on_change: F, mut stop: watch::Receiver<bool>)
where
    F: FnMut(serde_json::Value) + Send + 'static,
{
    let mut last = stamp(&path);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        let current = stamp(&path);
        if current == last {
            continue;
        }
        last = current;
        match read_config(&path) {
            Ok(value) => {
                info!(path = %path.display(), "base config changed");
                on_change(value);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable base config"),
        }
    }
    debug!(path = %path.display(), "config watcher stopped");
}

/// Handle to a running watcher thread. Dropping it stops the thread.
pub struct ConfigWatcher {
    stop: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    pub fn spawn<F>(path: PathBuf, period: Duration, on_change: F) -> Result<Self>
    where
        F: FnMut(serde_json::Value) + Send + 'static,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .context("failed to build config watcher runtime")?;
        let (stop, stop_rx) = watch::channel(false);
        info!(path = %path.display(), "watching base config");
        let thread = std::thread::Builder::new()
            .name("config-watcher".to_string())
            .spawn(move || runtime.block_on(watch_file(path, period, on_change, stop_rx)))
            .context("failed to spawn config watcher thread")?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("config watcher thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_config_converts_to_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("base.toml");
        std::fs::write(&path, "site = \"lab\"\n[modules]\nping = true\n").unwrap();
        let value = read_config(&path).unwrap();
        assert_eq!(value["site"], "lab");
        assert_eq!(value["modules"]["ping"], true);

        std::fs::write(&path, "not = = toml").unwrap();
        assert!(read_config(&path).is_err());
    }

    #[tokio::test]
    async fn test_change_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("base.toml");
        std::fs::write(&path, "a = 1\n").unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(watch_file(
            path.clone(),
            Duration::from_millis(10),
            move |value| {
                let _ = tx.send(value);
            },
            stop_rx,
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(&path, "a = 22\nb = \"changed\"\n").unwrap();

        let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value["a"], 22);
        assert_eq!(value["b"], "changed");

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_watcher_thread_stops_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("base.toml");
        std::fs::write(&path, "a = 1\n").unwrap();
        let watcher = ConfigWatcher::spawn(path, Duration::from_millis(10), |_| {}).unwrap();
        drop(watcher);
    }
}
