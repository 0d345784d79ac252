//! Shared per-asset progress, persisted as a flat JSON object.
//!
//! Writers may live in different OS processes, so every update is a
//! read-modify-write cycle under an exclusive lock file, retried with
//! exponential backoff. The file itself is only ever replaced by rename.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::atomic::{remove_if_exists, write_atomic};
use crate::config::ProgressConfig;
use crate::error::{MediaError, Result};

pub type ProgressSnapshot = BTreeMap<String, u8>;

#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
    lock_path: PathBuf,
    max_attempts: u32,
    backoff: Duration,
    stale_lock: Duration,
}

impl ProgressStore {
    pub fn new(config: &ProgressConfig) -> Self {
        Self::at(config.file.clone(), config)
    }

    /// Store at an explicit location, retry settings from `config`
    pub fn at(path: PathBuf, config: &ProgressConfig) -> Self {
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_name),
            path,
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            stale_lock: Duration::from_secs(config.stale_lock_secs),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Start a run with an empty mapping, discarding anything left behind
    pub async fn create(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        remove_if_exists(&self.lock_path).await?;
        self.write_snapshot(ProgressSnapshot::new()).await
    }

    /// Raise `key` to `percent` (clamped to 100). Stored values never decrease.
    pub async fn update(&self, key: &str, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        let mut last_error = String::new();

        for attempt in 0..self.max_attempts {
            match self.try_update(key, percent).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    debug!("Progress write for {} attempt {} failed: {}", key, attempt + 1, e);
                }
            }
            if attempt + 1 < self.max_attempts {
                tokio::time::sleep(self.backoff * 2u32.pow(attempt.min(6))).await;
            }
        }

        Err(MediaError::ProgressWrite {
            key: key.to_string(),
            attempts: self.max_attempts,
            message: last_error,
        })
    }

    /// Like [`update`](Self::update) but a dropped write is only logged
    pub async fn record(&self, key: &str, percent: u8) {
        if let Err(e) = self.update(key, percent).await {
            warn!("⚠️ {}", e);
        }
    }

    /// Current mapping; a missing file reads as empty
    pub async fn snapshot(&self) -> Result<ProgressSnapshot> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProgressSnapshot::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the store at the end of a run
    pub async fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path).await?;
        remove_if_exists(&self.lock_path).await
    }

    async fn try_update(&self, key: &str, percent: u8) -> Result<()> {
        let _lock = self.acquire_lock().await?;
        let mut snapshot = self.snapshot().await?;
        if matches!(snapshot.get(key), Some(current) if *current >= percent) {
            return Ok(());
        }
        snapshot.insert(key.to_string(), percent);
        self.write_snapshot(snapshot).await
    }

    async fn acquire_lock(&self) -> Result<LockGuard> {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(_) => Ok(LockGuard {
                path: self.lock_path.clone(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.lock_is_stale().await {
                    warn!("🔓 Removing abandoned progress lock {}", self.lock_path.display());
                    remove_if_exists(&self.lock_path).await?;
                }
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lock_is_stale(&self) -> bool {
        let modified = match tokio::fs::metadata(&self.lock_path).await {
            Ok(meta) => meta.modified().ok(),
            Err(_) => return false,
        };
        modified
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .map_or(false, |age| age > self.stale_lock)
    }

    async fn write_snapshot(&self, snapshot: ProgressSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec(&snapshot)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Aggregate view emitted to whatever sits outside the recoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Mean of all known percentages
    pub overall: f64,
    pub total_files: usize,
    /// Files below 100
    pub active_files: Vec<String>,
    pub files: ProgressSnapshot,
}

impl ProgressUpdate {
    pub fn from_snapshot(files: ProgressSnapshot) -> Self {
        let overall = if files.is_empty() {
            0.0
        } else {
            files.values().map(|v| *v as f64).sum::<f64>() / files.len() as f64
        };
        let active_files = files
            .iter()
            .filter(|(_, pct)| **pct < 100)
            .map(|(name, _)| name.clone())
            .collect();
        Self {
            overall,
            total_files: files.len(),
            active_files,
            files,
        }
    }
}

/// Tells a watcher when a run is over. Files can all sit at 100 while
/// queued units have not written their first value yet, so only the
/// removal of the store, after it was seen, ends the run.
#[derive(Debug, Default)]
pub struct RunWatch {
    seen_store: bool,
}

impl RunWatch {
    /// Feed one poll; true once a store that existed is gone
    pub fn observe(&mut self, store_exists: bool) -> bool {
        if store_exists {
            self.seen_store = true;
            false
        } else {
            self.seen_store
        }
    }
}

/// Polls a [`ProgressStore`] at a fixed interval and streams updates
pub struct ProgressMonitor {
    updates: mpsc::Receiver<ProgressUpdate>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProgressMonitor {
    pub fn spawn(store: ProgressStore, interval: Duration) -> Self {
        let (tx, updates) = mpsc::channel(16);
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                let snapshot = match store.snapshot().await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        debug!("Progress poll failed: {}", e);
                        continue;
                    }
                };
                if tx.send(ProgressUpdate::from_snapshot(snapshot)).await.is_err() {
                    break;
                }
            }
        });

        Self {
            updates,
            shutdown,
            task,
        }
    }

    pub async fn next(&mut self) -> Option<ProgressUpdate> {
        self.updates.recv().await
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        drop(self.updates);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ProgressStore {
        let config = ProgressConfig {
            file: dir.path().join("progress.json"),
            max_attempts: 4,
            backoff_ms: 1,
            stale_lock_secs: 60,
            poll_interval_ms: 10,
        };
        ProgressStore::new(&config)
    }

    #[tokio::test]
    async fn test_create_update_snapshot_clear() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.create().await.unwrap();
        assert!(store.snapshot().await.unwrap().is_empty());

        store.update("a.mp4", 40).await.unwrap();
        store.update("b.jpg", 100).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.get("a.mp4"), Some(&40));
        assert_eq!(snapshot.get("b.jpg"), Some(&100));

        store.clear().await.unwrap();
        assert!(!store.exists());
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_values_never_decrease_and_clamp() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.create().await.unwrap();

        store.update("clip.mp4", 60).await.unwrap();
        store.update("clip.mp4", 20).await.unwrap();
        assert_eq!(store.snapshot().await.unwrap()["clip.mp4"], 60);

        store.update("clip.mp4", 250).await.unwrap();
        assert_eq!(store.snapshot().await.unwrap()["clip.mp4"], 100);
    }

    #[tokio::test]
    async fn test_zero_is_recorded() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.create().await.unwrap();
        store.update("new.png", 0).await.unwrap();
        assert_eq!(store.snapshot().await.unwrap().get("new.png"), Some(&0));
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_every_key() {
        let dir = TempDir::new().unwrap();
        let config = ProgressConfig {
            file: dir.path().join("progress.json"),
            max_attempts: 50,
            backoff_ms: 1,
            stale_lock_secs: 60,
            poll_interval_ms: 10,
        };
        let store = Arc::new(ProgressStore::new(&config));
        store.create().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let key = format!("asset_{}.jpg", i);
                for pct in [10u8, 50, 100] {
                    store.update(&key, pct).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 8);
        assert!(snapshot.values().all(|v| *v == 100));
    }

    #[tokio::test]
    async fn test_held_lock_drops_write_after_budget() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.create().await.unwrap();
        store.update("keep.jpg", 30).await.unwrap();

        let lock = dir.path().join("progress.json.lock");
        std::fs::write(&lock, b"").unwrap();

        let result = store.update("other.jpg", 50).await;
        assert!(matches!(result, Err(MediaError::ProgressWrite { attempts: 4, .. })));
        store.record("other.jpg", 50).await;

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.get("keep.jpg"), Some(&30));
        assert!(!snapshot.contains_key("other.jpg"));
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let config = ProgressConfig {
            file: dir.path().join("progress.json"),
            max_attempts: 3,
            backoff_ms: 1,
            stale_lock_secs: 0,
            poll_interval_ms: 10,
        };
        let store = ProgressStore::new(&config);
        store.create().await.unwrap();

        std::fs::write(dir.path().join("progress.json.lock"), b"").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.update("after_crash.mp4", 70).await.unwrap();
        assert_eq!(store.snapshot().await.unwrap()["after_crash.mp4"], 70);
    }

    #[test]
    fn test_update_aggregate() {
        let mut files = ProgressSnapshot::new();
        files.insert("a.jpg".to_string(), 100);
        files.insert("b.mp4".to_string(), 50);
        files.insert("c.mp4".to_string(), 0);
        let update = ProgressUpdate::from_snapshot(files);
        assert_eq!(update.overall, 50.0);
        assert_eq!(update.total_files, 3);
        assert_eq!(update.active_files, vec!["b.mp4".to_string(), "c.mp4".to_string()]);

        let empty = ProgressUpdate::from_snapshot(ProgressSnapshot::new());
        assert_eq!(empty.overall, 0.0);
        assert!(empty.active_files.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_streams_updates() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.create().await.unwrap();
        store.update("a.jpg", 100).await.unwrap();
        store.update("b.mp4", 20).await.unwrap();

        let mut monitor = ProgressMonitor::spawn(store.clone(), Duration::from_millis(10));
        let update = monitor.next().await.unwrap();
        assert_eq!(update.total_files, 2);
        assert_eq!(update.overall, 60.0);
        assert_eq!(update.active_files, vec!["b.mp4".to_string()]);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_run_watch_waits_for_store_removal() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut watch = RunWatch::default();

        assert!(!watch.observe(store.exists()));

        store.create().await.unwrap();
        store.update("E1_P001_a.png", 100).await.unwrap();
        let update = ProgressUpdate::from_snapshot(store.snapshot().await.unwrap());
        assert!(update.active_files.is_empty());
        assert!(!watch.observe(store.exists()));

        store.clear().await.unwrap();
        assert!(watch.observe(store.exists()));
    }
}
