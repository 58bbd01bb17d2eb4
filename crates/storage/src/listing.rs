//! Cached view of every artifact in every enabled category.
//!
//! The snapshot sits behind a short-held `RwLock` that is never held across
//! I/O. Rebuilding is single-flight: concurrent callers that find the cache
//! invalid queue up on the rebuild lock, and all but the first find a fresh
//! snapshot once they get it.
//!
//! Every invalidation bumps a generation counter. A scan that started before
//! an invalidation is handed back to its caller, but never installed.

use crate::models::Artifact;
use crate::settings::StoreSettings;
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::fs::{self, DirEntry};
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    snapshot: Arc<[Artifact]>,
    valid: bool,
    generation: u64,
}

pub(crate) struct ListingCache {
    settings: Arc<StoreSettings>,
    state: RwLock<State>,
    rebuild: Mutex<()>,
}

impl ListingCache {
    pub(crate) fn new(settings: Arc<StoreSettings>) -> Self {
        Self {
            settings,
            state: RwLock::new(State::default()),
            rebuild: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self) -> Option<Arc<[Artifact]>> {
        let state = self.read();
        state.valid.then(|| Arc::clone(&state.snapshot))
    }

    /// Mark the snapshot stale. The next [`list`](Self::list) rescans.
    pub(crate) fn invalidate(&self) {
        let mut state = self.write();
        state.valid = false;
        state.generation = state.generation.wrapping_add(1);
    }

    #[cfg(test)]
    fn is_valid(&self) -> bool {
        self.read().valid
    }

    /// Every artifact, newest first. Download counts are left at zero.
    pub(crate) async fn list(&self) -> Arc<[Artifact]> {
        if let Some(snapshot) = self.cached() {
            return snapshot;
        }

        let _rebuilding = self.rebuild.lock().await;
        // Someone else may have rebuilt it while we waited.
        if let Some(snapshot) = self.cached() {
            return snapshot;
        }

        let generation = self.read().generation;
        let mut artifacts: Vec<Artifact> = scan(&self.settings).collect().await;
        sort_newest_first(&mut artifacts);
        let artifacts: Arc<[Artifact]> = artifacts.into();

        let mut state = self.write();
        if state.generation == generation {
            state.snapshot = Arc::clone(&artifacts);
            state.valid = true;
            tracing::debug!(count = artifacts.len(), "Rebuilt listing cache");
        } else {
            tracing::debug!("Listing changed during scan, not caching");
        }
        artifacts
    }
}

pub(crate) fn sort_newest_first(artifacts: &mut [Artifact]) {
    artifacts.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| a.category.cmp(&b.category))
            .then_with(|| a.filename.cmp(&b.filename))
    });
}

/// Walk every enabled category directory.
///
/// Unreadable directories and entries are logged and skipped: a listing is
/// always served, even if it is incomplete.
fn scan(settings: &StoreSettings) -> impl Stream<Item = Artifact> + '_ {
    stream! {
        for category in &settings.categories {
            let dir = settings.category_dir(&category.name);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // Not created yet.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    tracing::warn!(path = %dir.display(), error = %err, "Could not read category directory");
                    continue;
                },
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(path = %dir.display(), error = %err, "Could not read category directory");
                        break;
                    },
                };
                if let Some(artifact) = artifact(settings, &category.name, entry).await {
                    yield artifact;
                }
            }
        }
    }
}

async fn artifact(settings: &StoreSettings, category: &str, entry: DirEntry) -> Option<Artifact> {
    let filename = entry.file_name().into_string().ok()?;
    if filename.starts_with('.') || !settings.is_allowed(&filename) {
        return None;
    }
    let metadata = match entry.metadata().await {
        Ok(metadata) => metadata,
        // Deleted between listing the directory and reading the entry.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(path = %entry.path().display(), error = %err, "Could not read artifact metadata");
            return None;
        },
    };
    if !metadata.is_file() {
        return None;
    }
    let modified = metadata.modified().ok()?.into();
    Some(Artifact::new(category, filename, metadata.len(), modified))
}
