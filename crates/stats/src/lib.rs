//! Download accounting.
//!
//! Counters live in memory and are bumped synchronously; nothing on the
//! download path ever waits for the disk. A single background task persists
//! the whole table as one JSON object (`{"category/filename": count}`),
//! replacing the file atomically. Bursts of increments collapse into one
//! write.
//!
//! Increments recorded after the last completed flush are lost if the process
//! dies without a graceful shutdown.

pub mod error;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared handle to the download counters. Cheap to clone.
#[derive(Clone)]
pub struct DownloadCounter {
    inner: Arc<Inner>,
}

struct Inner {
    path: Option<PathBuf>,
    counts: Mutex<HashMap<String, u64>>,
    /// Bumped on every increment.
    changes: AtomicU64,
    /// Value of `changes` captured by the last successful flush.
    flushed: AtomicU64,
    notify: Notify,
    /// Serializes writers so an older table never overwrites a newer one.
    writing: tokio::sync::Mutex<()>,
    interval: Duration,
}

fn key(category: &str, filename: &str) -> String {
    format!("{category}/{filename}")
}

impl DownloadCounter {
    /// Load counters from `path`, or start empty.
    ///
    /// A missing file is normal on first start. An unreadable or corrupt file
    /// is logged and ignored, because accounting must never block startup. The
    /// next flush replaces it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let counts = match load(&path) {
            Ok(counts) => {
                tracing::debug!(path = %path.display(), entries = counts.len(), "Loaded download counts");
                counts
            },
            Err(err) if matches!(&*err, ErrorKind::Io(e) if e.kind() == std::io::ErrorKind::NotFound) => HashMap::new(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = ?err, "Ignoring unreadable download counts");
                HashMap::new()
            },
        };
        Self::build(Some(path), counts)
    }

    /// Counters that are never written anywhere.
    pub fn in_memory() -> Self {
        Self::build(None, HashMap::new())
    }

    fn build(path: Option<PathBuf>, counts: HashMap<String, u64>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                counts: Mutex::new(counts),
                changes: AtomicU64::new(0),
                flushed: AtomicU64::new(0),
                notify: Notify::new(),
                writing: tokio::sync::Mutex::new(()),
                interval: Duration::ZERO,
            }),
        }
    }

    /// Minimum delay between two writes of the counter file.
    ///
    /// Must be called before the handle is cloned or the flusher spawned.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.interval = interval;
        }
        self
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.inner.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Count one download. Never blocks on I/O and never fails.
    pub fn record(&self, category: &str, filename: &str) {
        *self.counts().entry(key(category, filename)).or_default() += 1;
        self.inner.changes.fetch_add(1, Ordering::AcqRel);
        self.inner.notify.notify_one();
    }

    pub fn count(&self, category: &str, filename: &str) -> u64 {
        self.counts().get(&key(category, filename)).copied().unwrap_or_default()
    }

    /// Copy of the whole table, keyed by `category/filename`.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts().iter().map(|(key, count)| (key.clone(), *count)).collect()
    }

    /// Returns `true` if there are increments not yet on disk.
    pub fn is_dirty(&self) -> bool {
        self.inner.changes.load(Ordering::Acquire) != self.inner.flushed.load(Ordering::Acquire)
    }

    /// Write the table to disk now, if anything changed since the last write.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = self.inner.path.clone() else {
            return Ok(());
        };
        let _writing = self.inner.writing.lock().await;
        let changes = self.inner.changes.load(Ordering::Acquire);
        if changes == self.inner.flushed.load(Ordering::Acquire) {
            return Ok(());
        }
        let snapshot = self.snapshot();
        let data = serde_json::to_vec_pretty(&snapshot).or_raise(|| ErrorKind::Serialize)?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&target, &data))
            .await
            .or_raise(|| ErrorKind::Interrupted)?
            .or_raise(|| ErrorKind::Persist(path.clone()))?;
        self.inner.flushed.store(changes, Ordering::Release);
        tracing::debug!(path = %path.display(), entries = snapshot.len(), "Flushed download counts");
        Ok(())
    }

    /// Spawn the background writer.
    ///
    /// It sleeps until something is recorded, waits for the flush interval
    /// (if any) so further increments pile up, then writes once. On
    /// cancellation it writes whatever is left and exits.
    pub fn spawn_flusher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let counter = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = counter.inner.notify.notified() => {},
                }
                if !counter.inner.interval.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(counter.inner.interval) => {},
                    }
                }
                if let Err(err) = counter.flush().await {
                    tracing::warn!(error = ?err, "Could not persist download counts");
                }
            }
            if let Err(err) = counter.flush().await {
                tracing::error!(error = ?err, "Could not persist download counts on shutdown");
            }
        })
    }
}

fn load(path: &Path) -> Result<HashMap<String, u64>> {
    let data = std::fs::read(path).map_err(ErrorKind::Io)?;
    serde_json::from_slice(&data).or_raise(|| ErrorKind::Persist(path.to_path_buf()))
}

fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::Builder::new().prefix(".stats-").suffix(".tmp").tempfile_in(dir).map_err(ErrorKind::Io)?;
    file.write_all(data).map_err(ErrorKind::Io)?;
    file.as_file().sync_all().map_err(ErrorKind::Io)?;
    file.persist(path).map_err(|e| ErrorKind::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_artifact() {
        let counter = DownloadCounter::in_memory();
        counter.record("vanilla", "a.zip");
        counter.record("vanilla", "a.zip");
        counter.record("gapps", "a.zip");
        assert_eq!(counter.count("vanilla", "a.zip"), 2);
        assert_eq!(counter.count("gapps", "a.zip"), 1);
        assert_eq!(counter.count("vanilla", "b.zip"), 0);
        assert_eq!(counter.snapshot().keys().collect::<Vec<_>>(), vec!["gapps/a.zip", "vanilla/a.zip"]);
    }

    #[tokio::test]
    async fn flush_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let counter = DownloadCounter::open(&path);
        counter.record("vanilla", "a.zip");
        counter.record("vanilla", "a.zip");
        assert!(counter.is_dirty());
        counter.flush().await.unwrap();
        assert!(!counter.is_dirty());

        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({ "vanilla/a.zip": 2 }));

        let reopened = DownloadCounter::open(&path);
        assert_eq!(reopened.count("vanilla", "a.zip"), 2);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let counter = DownloadCounter::open(&path);
        assert!(counter.snapshot().is_empty());
        counter.record("vanilla", "a.zip");
        counter.flush().await.unwrap();
        assert_eq!(DownloadCounter::open(&path).count("vanilla", "a.zip"), 1);
    }

    #[tokio::test]
    async fn flush_without_changes_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let counter = DownloadCounter::open(&path);
        counter.flush().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn flusher_writes_remaining_counts_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let counter = DownloadCounter::open(&path).with_flush_interval(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let flusher = counter.spawn_flusher(cancel.clone());

        for _ in 0..5 {
            counter.record("vanilla", "a.zip");
        }
        cancel.cancel();
        flusher.await.unwrap();

        assert!(!counter.is_dirty());
        assert_eq!(DownloadCounter::open(&path).count("vanilla", "a.zip"), 5);
    }

    #[tokio::test]
    async fn flusher_persists_without_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let counter = DownloadCounter::open(&path);
        let cancel = CancellationToken::new();
        let _flusher = counter.spawn_flusher(cancel.clone());

        counter.record("vanilla", "a.zip");
        for _ in 0..200 {
            if !counter.is_dirty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(DownloadCounter::open(&path).count("vanilla", "a.zip"), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unflushed_counts_are_lost_on_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let counter = DownloadCounter::open(&path);
        counter.record("vanilla", "a.zip");
        counter.flush().await.unwrap();
        counter.record("vanilla", "a.zip");
        drop(counter);

        assert_eq!(DownloadCounter::open(&path).count("vanilla", "a.zip"), 1);
    }
}
