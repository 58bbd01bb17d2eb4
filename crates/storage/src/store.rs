//! The artifact store.
//!
//! Uploads are streamed into the scratch directory with no lock held. Only the
//! final step (retention, rename, cache invalidation) runs under the
//! store-wide mutation lock, and it runs to completion on a blocking thread
//! even if the request that started it goes away.

use crate::commit::{PARTIAL_SUFFIX, move_into_place};
use crate::error::{ErrorKind, Result};
use crate::listing::ListingCache;
use crate::models::{Artifact, CategoryInfo};
use crate::path::{extension, sanitize_filename, validate_filename};
use crate::retention::{Eviction, HOLDING_PREFIX};
use crate::settings::{Category, StoreSettings};
use crate::signature::{Format, PeekableUpload};
use exn::ResultExt;
use shelf_stats::DownloadCounter;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::instrument;

const UPLOAD_PREFIX: &str = "upload-";
const UPLOAD_SUFFIX: &str = ".tmp";

/// An existing artifact, as resolved by [`ArtifactStore::locate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub category: String,
    /// Stored name, after sanitising.
    pub filename: String,
    pub path: PathBuf,
}

/// Handle to the artifact store. Cheap to clone.
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Arc<StoreSettings>,
    mutation: Arc<Mutex<()>>,
    listing: ListingCache,
    counter: DownloadCounter,
}

impl ArtifactStore {
    pub fn new(settings: StoreSettings, counter: DownloadCounter) -> Self {
        let settings = Arc::new(settings);
        Self {
            inner: Arc::new(Inner {
                listing: ListingCache::new(Arc::clone(&settings)),
                settings,
                mutation: Arc::new(Mutex::new(())),
                counter,
            }),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.inner.settings
    }

    /// Handle to the download counters.
    pub fn downloads(&self) -> &DownloadCounter {
        &self.inner.counter
    }

    /// Create the scratch directory and every category directory.
    ///
    /// Safe to call more than once. Leftovers of a previous run that died
    /// mid-upload are removed: abandoned uploads and eviction holding
    /// directories in the scratch directory, and hidden partial copies in the
    /// category directories.
    #[instrument(skip(self), fields(root = %self.inner.settings.root.display()))]
    pub async fn initialize(&self) -> Result<()> {
        let settings = &self.inner.settings;
        let category_dirs: Vec<PathBuf> =
            settings.categories.iter().map(|category| settings.category_dir(&category.name)).collect();
        for dir in std::iter::once(&settings.temp_dir).chain(&category_dirs) {
            tokio::fs::create_dir_all(dir).await.or_raise(|| ErrorKind::Initialize(dir.clone()))?;
        }

        let _guard = self.inner.mutation.lock().await;
        let mut removed = remove_leftovers(&settings.temp_dir, is_scratch_leftover).await;
        for dir in &category_dirs {
            removed += remove_leftovers(dir, is_partial_copy).await;
        }
        if removed > 0 {
            tracing::info!(removed, "Removed leftovers of interrupted uploads");
        }
        self.inner.listing.invalidate();
        tracing::info!(categories = settings.categories.len(), "Storage initialized");
        Ok(())
    }

    /// Every artifact in every enabled category, newest first.
    pub async fn list_files(&self) -> Vec<Artifact> {
        let snapshot = self.inner.listing.list().await;
        snapshot.iter().map(|artifact| self.with_downloads(artifact)).collect()
    }

    /// Artifacts of one category, newest first.
    pub async fn list_files_by_category(&self, category: &str) -> Result<Vec<Artifact>> {
        self.inner.settings.category(category)?;
        let snapshot = self.inner.listing.list().await;
        Ok(snapshot
            .iter()
            .filter(|artifact| artifact.category == category)
            .map(|artifact| self.with_downloads(artifact))
            .collect())
    }

    fn with_downloads(&self, artifact: &Artifact) -> Artifact {
        let downloads = self.inner.counter.count(&artifact.category, &artifact.filename);
        artifact.clone().with_downloads(downloads)
    }

    /// Settings and current file count of every enabled category.
    pub async fn category_stats(&self) -> Vec<CategoryInfo> {
        let snapshot = self.inner.listing.list().await;
        self.inner
            .settings
            .categories
            .iter()
            .map(|category| CategoryInfo {
                name: category.name.clone(),
                display_name: category.display_name.clone(),
                description: category.description.clone(),
                max_files: category.max_files,
                file_count: snapshot.iter().filter(|artifact| artifact.category == category.name).count(),
            })
            .collect()
    }

    /// Check a request against the store's rules before any I/O happens.
    ///
    /// Returns the category and the sanitised filename.
    fn validate(&self, category: &str, filename: &str) -> Result<(Category, String)> {
        let category = self.inner.settings.category(category)?.clone();
        let filename = sanitize_filename(filename);
        validate_filename(&filename)?;
        if !self.inner.settings.is_allowed(&filename) {
            exn::bail!(ErrorKind::DisallowedExtension(extension(&filename).unwrap_or_default()));
        }
        Ok((category, filename))
    }

    /// Store an upload as `category/filename`, replacing any artifact of the
    /// same name and evicting the oldest ones if the category is full.
    ///
    /// The content must start with the signature its extension promises. On
    /// any failure the category directory is left exactly as it was.
    #[instrument(skip(self, reader))]
    pub async fn save<R>(&self, category: &str, filename: &str, reader: R) -> Result<Artifact>
    where
        R: AsyncRead + Unpin,
    {
        let (category, filename) = self.validate(category, filename)?;
        let mut upload = PeekableUpload::new(reader);
        if let Some(format) = extension(&filename).as_deref().and_then(Format::from_extension) {
            upload.verify(format).await?;
        }

        let (temp, size) = self.receive(upload.into_reader()).await?;
        tracing::debug!(size, temp = %temp.display(), "Upload received");

        let dest = self.inner.settings.category_dir(&category.name).join(&filename);
        let guard = Arc::clone(&self.inner.mutation).lock_owned().await;
        let inner = Arc::clone(&self.inner);
        let artifact = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let result = inner.commit(&category, &filename, temp, size);
            inner.listing.invalidate();
            result
        })
        .await
        .or_raise(|| ErrorKind::Commit(dest.clone()))??;

        tracing::info!(
            category = %artifact.category,
            filename = %artifact.filename,
            size = artifact.size,
            "Artifact saved"
        );
        Ok(artifact)
    }

    /// Stream `reader` into a fresh scratch file and sync it to disk.
    ///
    /// The returned [`TempPath`] deletes the file when dropped, including
    /// when this future is cancelled half way.
    async fn receive<R>(&self, mut reader: R) -> Result<(TempPath, u64)>
    where
        R: AsyncRead + Unpin,
    {
        let named = tempfile::Builder::new()
            .prefix(UPLOAD_PREFIX)
            .suffix(UPLOAD_SUFFIX)
            .tempfile_in(&self.inner.settings.temp_dir)
            .or_raise(|| ErrorKind::TempFile)?;
        let (file, temp) = named.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let size = tokio::io::copy(&mut reader, &mut file).await.or_raise(|| ErrorKind::TempFile)?;
        file.flush().await.or_raise(|| ErrorKind::TempFile)?;
        file.sync_all().await.or_raise(|| ErrorKind::TempFile)?;
        Ok((temp, size))
    }

    /// Remove an artifact.
    #[instrument(skip(self))]
    pub async fn delete(&self, category: &str, filename: &str) -> Result<()> {
        let (category, filename) = self.validate(category, filename)?;
        let path = self.inner.settings.category_dir(&category.name).join(&filename);
        let relative = PathBuf::from(&category.name).join(&filename);

        let guard = Arc::clone(&self.inner.mutation).lock_owned().await;
        let inner = Arc::clone(&self.inner);
        let removed = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let removed = fs::remove_file(&path);
            inner.listing.invalidate();
            removed
        })
        .await
        .or_raise(|| ErrorKind::Io(std::io::Error::other("delete task failed")))?;

        match removed {
            Ok(()) => {
                tracing::info!(path = %relative.display(), "Artifact deleted");
                Ok(())
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => exn::bail!(ErrorKind::NotFound(relative)),
            Err(err) => Err(ErrorKind::Io(err).into()),
        }
    }

    /// Resolve a request for an existing artifact.
    ///
    /// The name goes through the same sanitising as uploads, so the returned
    /// [`Located`] carries the name the artifact is stored and counted under.
    pub async fn locate(&self, category: &str, filename: &str) -> Result<Located> {
        let (category, filename) = self.validate(category, filename)?;
        let path = self.inner.settings.category_dir(&category.name).join(&filename);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {},
            Ok(_) => exn::bail!(ErrorKind::NotFound(PathBuf::from(&category.name).join(&filename))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                exn::bail!(ErrorKind::NotFound(PathBuf::from(&category.name).join(&filename)))
            },
            Err(err) => return Err(ErrorKind::Io(err).into()),
        }
        Ok(Located {
            category: category.name,
            filename,
            path,
        })
    }

    /// Count a download. Never fails and never waits for the disk.
    pub fn record_download(&self, located: &Located) {
        self.inner.counter.record(&located.category, &located.filename);
    }
}

impl Inner {
    /// Move a received upload into its category. Blocking; the mutation lock
    /// must be held.
    fn commit(&self, category: &Category, filename: &str, temp: TempPath, size: u64) -> Result<Artifact> {
        let dir = self.settings.category_dir(&category.name);
        let dest = dir.join(filename);
        fs::create_dir_all(&dir).or_raise(|| ErrorKind::Commit(dest.clone()))?;

        let eviction = Eviction::stage(&category.name, &dir, &self.settings.temp_dir, category.max_files, filename)?;
        if let Err(err) = move_into_place(temp, &dest) {
            tracing::warn!(dest = %dest.display(), evictions = eviction.len(), "Commit failed, restoring evictions");
            eviction.rollback();
            return Err(err);
        }
        eviction.finish();

        let modified = fs::metadata(&dest)
            .and_then(|metadata| metadata.modified())
            .map(OffsetDateTime::from)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let downloads = self.counter.count(&category.name, filename);
        Ok(Artifact::new(&category.name, filename, size, modified).with_downloads(downloads))
    }
}

fn is_scratch_leftover(name: &str, is_dir: bool) -> bool {
    if is_dir {
        name.starts_with(HOLDING_PREFIX)
    } else {
        name.starts_with(UPLOAD_PREFIX) && name.ends_with(UPLOAD_SUFFIX)
    }
}

fn is_partial_copy(name: &str, is_dir: bool) -> bool {
    !is_dir && name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)
}

/// Delete the entries of `dir` that `matches` picks. Best effort; returns
/// how many were removed.
async fn remove_leftovers(dir: &Path, matches: fn(&str, bool) -> bool) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !matches(name, file_type.is_dir()) {
            continue;
        }
        let path = entry.path();
        let result = if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Removed leftover");
                removed += 1;
            },
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "Could not remove leftover"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn zip(body: &str) -> Vec<u8> {
        let mut data = b"PK\x03\x04".to_vec();
        data.extend_from_slice(body.as_bytes());
        data
    }

    async fn store(root: &Path) -> ArtifactStore {
        let settings = StoreSettings::new(root)
            .with_extensions([".zip", ".img"])
            .with_category(Category::new("vanilla", 3).with_display_name("Vanilla"))
            .with_category(Category::new("gapps", 2));
        let store = ArtifactStore::new(settings, DownloadCounter::in_memory());
        store.initialize().await.unwrap();
        store
    }

    fn on_disk(root: &Path, category: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root.join(category))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        fs::write(root.path().join("temp").join("upload-abandoned.tmp"), b"partial").unwrap();
        store.initialize().await.unwrap();

        assert!(root.path().join("vanilla").is_dir());
        assert!(root.path().join("gapps").is_dir());
        assert_eq!(fs::read_dir(root.path().join("temp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn initialize_removes_interrupted_commits() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        store.save("vanilla", "keep.zip", &zip("keep")[..]).await.unwrap();
        let holding = root.path().join("temp").join("evict-abc123");
        fs::create_dir(&holding).unwrap();
        fs::write(holding.join("old.zip"), zip("old")).unwrap();
        fs::write(root.path().join("vanilla/.tmpXYZ.partial"), zip("half")).unwrap();
        fs::write(root.path().join("gapps/.keep"), b"").unwrap();

        store.initialize().await.unwrap();
        assert!(!holding.exists());
        assert_eq!(on_disk(root.path(), "vanilla"), vec!["keep.zip"]);
        assert_eq!(on_disk(root.path(), "gapps"), vec![".keep"]);
        assert_eq!(store.list_files().await.len(), 1);
    }

    #[tokio::test]
    async fn downloads_are_counted_under_the_stored_name() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        store.save("vanilla", "a.zip", &zip("a")[..]).await.unwrap();

        for spelling in ["a.zip", "x/a.zip", " a.zip", "x\\a.zip"] {
            let located = store.locate("vanilla", spelling).await.unwrap();
            assert_eq!(located.filename, "a.zip");
            store.record_download(&located);
        }
        assert_eq!(store.downloads().count("vanilla", "a.zip"), 4);
        assert_eq!(store.list_files().await[0].downloads, 4);
    }

    #[tokio::test]
    async fn initialize_fails_when_root_is_a_file() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        fs::write(&file, b"").unwrap();
        let store = ArtifactStore::new(
            StoreSettings::new(&file).with_category(Category::new("vanilla", 1)),
            DownloadCounter::in_memory(),
        );
        let err = store.initialize().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Initialize(_)));
    }

    #[tokio::test]
    async fn retention_keeps_newest_three() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        for name in ["a.zip", "b.zip", "c.zip", "d.zip"] {
            store.save("vanilla", name, &zip(name)[..]).await.unwrap();
            // Distinct modification times.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(on_disk(root.path(), "vanilla"), vec!["b.zip", "c.zip", "d.zip"]);

        let listed: Vec<_> = store.list_files_by_category("vanilla").await.unwrap();
        let names: Vec<_> = listed.iter().map(|artifact| artifact.filename.as_str()).collect();
        assert_eq!(names, vec!["d.zip", "c.zip", "b.zip"]);
        assert!(fs::read_dir(root.path().join("temp")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn overwrite_replaces_without_eviction() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        for name in ["a.zip", "b.zip", "c.zip"] {
            store.save("vanilla", name, &zip(name)[..]).await.unwrap();
        }
        let artifact = store.save("vanilla", "a.zip", &zip("replacement")[..]).await.unwrap();

        assert_eq!(artifact.size, zip("replacement").len() as u64);
        assert_eq!(on_disk(root.path(), "vanilla"), vec!["a.zip", "b.zip", "c.zip"]);
        assert_eq!(fs::read(root.path().join("vanilla/a.zip")).unwrap(), zip("replacement"));
    }

    #[tokio::test]
    async fn round_trip() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        let saved = store.save("gapps", "nested/../pico.zip", &zip("pico")[..]).await.unwrap();
        assert_eq!(saved.filename, "pico.zip");

        let located = store.locate("gapps", "pico.zip").await.unwrap();
        assert_eq!(fs::read(&located.path).unwrap(), zip("pico"));
        let listed = store.list_files_by_category("gapps").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, "pico.zip");
        assert!(store.list_files_by_category("vanilla").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn raw_images_have_no_signature() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        store.save("vanilla", "boot.img", &b"\x00\x01anything"[..]).await.unwrap();
        assert!(store.locate("vanilla", "boot.img").await.is_ok());
    }

    #[tokio::test]
    async fn rejects_before_touching_disk() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;

        let err = store.save("beta", "a.zip", &zip("a")[..]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownCategory(_)));
        let err = store.save("vanilla", "a.exe", &zip("a")[..]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::DisallowedExtension(ext) if ext == ".exe"));
        let err = store.save("vanilla", "..", &zip("a")[..]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidFilename(_)));
        let err = store.save("vanilla", "a.zip", &b"<html>"[..]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SignatureMismatch(_)));
        let err = store.save("vanilla", "a.zip", &b""[..]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SignatureMismatch(_)));

        assert!(on_disk(root.path(), "vanilla").is_empty());
        assert!(fs::read_dir(root.path().join("temp")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        store.save("vanilla", "a.zip", &zip("a")[..]).await.unwrap();

        let err = store.delete("vanilla", "missing.zip").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(path) if path == Path::new("vanilla/missing.zip")));
        assert_eq!(on_disk(root.path(), "vanilla"), vec!["a.zip"]);

        store.delete("vanilla", "a.zip").await.unwrap();
        assert!(store.list_files().await.is_empty());
        let err = store.locate("vanilla", "a.zip").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn listing_is_stable_and_carries_live_counts() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        store.save("vanilla", "a.zip", &zip("a")[..]).await.unwrap();
        store.save("gapps", "b.zip", &zip("b")[..]).await.unwrap();

        let first = store.list_files().await;
        let second = store.list_files().await;
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);

        let located = store.locate("vanilla", "a.zip").await.unwrap();
        store.record_download(&located);
        store.record_download(&located);
        let third = store.list_files().await;
        let a = third.iter().find(|artifact| artifact.filename == "a.zip").unwrap();
        assert_eq!(a.downloads, 2);
        assert_eq!(store.downloads().count("vanilla", "a.zip"), 2);
    }

    #[tokio::test]
    async fn category_stats_report_counts() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        store.save("vanilla", "a.zip", &zip("a")[..]).await.unwrap();

        let stats = store.category_stats().await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "vanilla");
        assert_eq!(stats[0].display_name, "Vanilla");
        assert_eq!(stats[0].max_files, 3);
        assert_eq!(stats[0].file_count, 1);
        assert_eq!(stats[1].file_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_uploads_respect_the_limit() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        store.save("gapps", "old.zip", &zip("old")[..]).await.unwrap();

        let uploads: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let name = format!("build-{i}.zip");
                    store.save("gapps", &name, &zip(&name)[..]).await
                })
            })
            .collect();
        for upload in uploads {
            upload.await.unwrap().unwrap();
        }

        assert_eq!(on_disk(root.path(), "gapps").len(), 2);
        assert_eq!(store.list_files_by_category("gapps").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn readers_never_see_partial_uploads() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        let (mut client, server) = tokio::io::duplex(64);

        let saving = tokio::spawn({
            let store = store.clone();
            async move { store.save("vanilla", "a.zip", server).await }
        });
        client.write_all(&zip("first half ")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.locate("vanilla", "a.zip").await.is_err());
        assert!(store.list_files().await.is_empty());
        assert!(on_disk(root.path(), "vanilla").is_empty());

        client.write_all(b"second half").await.unwrap();
        drop(client);
        saving.await.unwrap().unwrap();
        assert_eq!(fs::read(root.path().join("vanilla/a.zip")).unwrap(), zip("first half second half"));
    }

    #[tokio::test]
    async fn abandoned_upload_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path()).await;
        let (mut client, server) = tokio::io::duplex(64);

        let saving = tokio::spawn({
            let store = store.clone();
            async move { store.save("vanilla", "a.zip", server).await }
        });
        client.write_all(&zip("partial")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        saving.abort();
        let _ = saving.await;

        assert!(on_disk(root.path(), "vanilla").is_empty());
        assert!(fs::read_dir(root.path().join("temp")).unwrap().next().is_none());
    }
}
