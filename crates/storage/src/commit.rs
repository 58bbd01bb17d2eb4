//! Moving a finished upload into place.

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::fs::File;
use std::io;
use std::path::Path;
use tempfile::TempPath;

/// Suffix of the hidden copies made when a rename crosses devices.
pub(crate) const PARTIAL_SUFFIX: &str = ".partial";

/// Atomically move the upload at `source` to `dest`, replacing any file of
/// the same name.
///
/// A plain rename when both sides share a volume. Otherwise the content is
/// copied into a hidden file next to `dest`, synced, and renamed over it, so
/// a reader opening `dest` sees either the old or the new complete file.
/// The source is removed in both cases.
pub(crate) fn move_into_place(source: TempPath, dest: &Path) -> Result<()> {
    let err = || ErrorKind::Commit(dest.to_path_buf());
    match source.persist(dest) {
        Ok(()) => Ok(()),
        Err(e) if e.error.kind() == io::ErrorKind::CrossesDevices => {
            tracing::debug!(dest = %dest.display(), "Rename crosses devices, copying instead");
            copy_into_place(e.path, dest).or_raise(err)
        },
        Err(e) => Err(ErrorKind::Io(e.error)).or_raise(err),
    }
}

fn copy_into_place(source: TempPath, dest: &Path) -> Result<()> {
    let dir = dest.parent().ok_or_raise(|| ErrorKind::Commit(dest.to_path_buf()))?;
    let mut partial = tempfile::Builder::new().prefix(".").suffix(PARTIAL_SUFFIX).tempfile_in(dir).map_err(ErrorKind::Io)?;
    let mut input = File::open(&source).map_err(ErrorKind::Io)?;
    io::copy(&mut input, partial.as_file_mut()).map_err(ErrorKind::Io)?;
    partial.as_file().sync_all().map_err(ErrorKind::Io)?;
    partial.persist(dest).map_err(|e| ErrorKind::Io(e.error))?;
    // Removes the source upload.
    drop(source);
    Ok(())
}
