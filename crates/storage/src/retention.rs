//! Per-category retention.
//!
//! Before a new artifact is moved into a category, the oldest files are
//! evicted until there is room for it. Evictions are staged: victims are
//! renamed into a private directory under the scratch directory, and only
//! deleted once the new artifact is in place. A failed commit puts them back.
//!
//! Everything in here is blocking and must run while the store's mutation
//! lock is held.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;

/// Prefix of the holding directories evictions are staged in.
pub(crate) const HOLDING_PREFIX: &str = "evict-";

struct Candidate {
    name: String,
    modified: SystemTime,
}

/// Victims chosen to make room in one category, oldest first.
///
/// Files named like the incoming upload are ignored: the commit replaces
/// them in place, so an overwrite never costs a slot.
pub(crate) fn select_victims(dir: &Path, max_files: usize, incoming: &str) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(ErrorKind::Io(err)).or_raise(|| ErrorKind::Retention(dir.display().to_string())),
    };

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(ErrorKind::Io)?;
        let metadata = entry.metadata().map_err(ErrorKind::Io)?;
        if metadata.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        // Hidden entries are the store's own in-flight copies, never artifacts.
        if name.starts_with('.') || name == incoming {
            continue;
        }
        candidates.push(Candidate {
            modified: metadata.modified().map_err(ErrorKind::Io)?,
            name,
        });
    }

    candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));

    // Make room for exactly one more file.
    let keep = max_files.saturating_sub(1);
    let excess = candidates.len().saturating_sub(keep);
    Ok(candidates.into_iter().take(excess).map(|candidate| candidate.name).collect())
}

/// Evictions moved out of a category but not yet deleted.
///
/// Call [`finish`](Self::finish) once the new artifact is committed, or
/// [`rollback`](Self::rollback) if the commit failed. Dropping an eviction
/// without either rolls it back.
#[derive(Debug)]
pub(crate) struct Eviction {
    category: String,
    holding: Option<TempDir>,
    /// `(original location, staged location)`
    staged: Vec<(PathBuf, PathBuf)>,
}

impl Eviction {
    /// Stage enough evictions in `dir` to make room for `incoming`.
    ///
    /// Either every victim is staged, or none is and the category directory is
    /// exactly as it was.
    pub(crate) fn stage(category: &str, dir: &Path, scratch: &Path, max_files: usize, incoming: &str) -> Result<Self> {
        let err = || ErrorKind::Retention(category.to_string());
        let victims = select_victims(dir, max_files, incoming).or_raise(err)?;
        let mut eviction = Self {
            category: category.to_string(),
            holding: None,
            staged: Vec::with_capacity(victims.len()),
        };
        if victims.is_empty() {
            return Ok(eviction);
        }

        let holding = tempfile::Builder::new().prefix(HOLDING_PREFIX).tempdir_in(scratch).or_raise(err)?;
        let holding_path = holding.path().to_path_buf();
        eviction.holding = Some(holding);
        for victim in victims {
            let original = dir.join(&victim);
            let staged = holding_path.join(&victim);
            if let Err(e) = fs::rename(&original, &staged) {
                tracing::warn!(path = %original.display(), error = %e, "Could not stage eviction, restoring category");
                eviction.restore();
                return Err(ErrorKind::Io(e)).or_raise(err);
            }
            tracing::debug!(path = %original.display(), "Staged eviction");
            eviction.staged.push((original, staged));
        }
        Ok(eviction)
    }

    pub(crate) fn len(&self) -> usize {
        self.staged.len()
    }

    /// Permanently delete the staged victims.
    pub(crate) fn finish(mut self) {
        for (original, _) in &self.staged {
            tracing::info!(category = %self.category, path = %original.display(), "Evicted old artifact");
        }
        self.staged.clear();
        if let Some(holding) = self.holding.take()
            && let Err(e) = holding.close()
        {
            tracing::warn!(category = %self.category, error = %e, "Could not remove evicted artifacts");
        }
    }

    /// Move every staged victim back where it came from.
    pub(crate) fn rollback(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        for (original, staged) in self.staged.drain(..).rev() {
            if let Err(e) = fs::rename(&staged, &original) {
                tracing::error!(
                    path = %original.display(),
                    staged = %staged.display(),
                    error = %e,
                    "Could not restore staged eviction"
                );
                // Keep the holding directory so the file is not lost.
                if let Some(holding) = self.holding.take() {
                    let _ = holding.keep();
                }
            }
        }
    }
}

impl Drop for Eviction {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            self.restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    /// Create files with strictly increasing modification times, in order.
    fn touch(dir: &Path, names: &[&str]) {
        let base = SystemTime::now() - Duration::from_secs(3600);
        for (i, name) in names.iter().enumerate() {
            let file = File::create(dir.join(name)).unwrap();
            file.set_modified(base + Duration::from_secs(i as u64 * 10)).unwrap();
        }
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> =
            fs::read_dir(dir).unwrap().map(|e| e.unwrap().file_name().into_string().unwrap()).collect();
        names.sort();
        names
    }

    #[test]
    fn selects_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a.zip", "b.zip", "c.zip"]);
        assert_eq!(select_victims(dir.path(), 3, "d.zip").unwrap(), vec!["a.zip"]);
        assert_eq!(select_victims(dir.path(), 2, "d.zip").unwrap(), vec!["a.zip", "b.zip"]);
        assert!(select_victims(dir.path(), 4, "d.zip").unwrap().is_empty());
    }

    #[test]
    fn ties_break_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        let when = SystemTime::now() - Duration::from_secs(60);
        for name in ["b.zip", "a.zip", "c.zip"] {
            File::create(dir.path().join(name)).unwrap().set_modified(when).unwrap();
        }
        assert_eq!(select_victims(dir.path(), 2, "d.zip").unwrap(), vec!["a.zip", "b.zip"]);
    }

    #[test]
    fn overwrite_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a.zip", "b.zip", "c.zip"]);
        assert!(select_victims(dir.path(), 3, "a.zip").unwrap().is_empty());
        assert_eq!(select_victims(dir.path(), 2, "a.zip").unwrap(), vec!["b.zip"]);
    }

    #[test]
    fn ignores_directories_and_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &[".a.zip.partial", "b.zip"]);
        fs::create_dir(dir.path().join("nested")).unwrap();
        assert!(select_victims(dir.path(), 2, "c.zip").unwrap().is_empty());
    }

    #[test]
    fn missing_directory_has_no_victims() {
        let dir = tempfile::tempdir().unwrap();
        assert!(select_victims(&dir.path().join("missing"), 1, "a.zip").unwrap().is_empty());
    }

    #[test]
    fn finish_deletes_victims() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a.zip", "b.zip", "c.zip"]);

        let eviction = Eviction::stage("vanilla", dir.path(), scratch.path(), 2, "d.zip").unwrap();
        assert_eq!(eviction.len(), 2);
        assert_eq!(names(dir.path()), vec!["c.zip"]);
        eviction.finish();
        assert_eq!(names(dir.path()), vec!["c.zip"]);
        assert!(names(scratch.path()).is_empty());
    }

    #[test]
    fn rollback_restores_victims() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a.zip", "b.zip", "c.zip"]);

        let eviction = Eviction::stage("vanilla", dir.path(), scratch.path(), 2, "d.zip").unwrap();
        eviction.rollback();
        assert_eq!(names(dir.path()), vec!["a.zip", "b.zip", "c.zip"]);
        assert!(names(scratch.path()).is_empty());
    }

    #[test]
    fn drop_restores_victims() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a.zip", "b.zip"]);

        drop(Eviction::stage("vanilla", dir.path(), scratch.path(), 1, "c.zip").unwrap());
        assert_eq!(names(dir.path()), vec!["a.zip", "b.zip"]);
    }

    #[test]
    fn staging_failure_leaves_category_untouched() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a.zip", "b.zip"]);
        let scratch = dir.path().join("does-not-exist");

        let err = Eviction::stage("vanilla", dir.path(), &scratch, 1, "c.zip").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Retention(category) if category == "vanilla"));
        assert_eq!(names(dir.path()), vec!["a.zip", "b.zip"]);
    }
}
