//! Filename validation and security utilities.
//!
//! Artifacts live directly inside their category directory, so every name
//! that reaches the filesystem must be a single, boring path component.

use crate::error::{ErrorKind, Result};
use std::path::{Component, Path};

/// Most filesystems refuse names longer than this (in bytes).
const MAX_FILENAME_LEN: usize = 255;

/// Reduce a client-supplied filename to its base name.
///
/// Browsers on Windows happily send `C:\Users\me\build.zip`, and hostile
/// clients send `../../etc/passwd`. Both separators are treated as such
/// regardless of platform, and only the last non-empty segment survives.
///
/// The result still has to pass [`validate_filename`].
///
/// ```
/// use shelf_storage::sanitize_filename;
/// assert_eq!(sanitize_filename("build.zip"), "build.zip");
/// assert_eq!(sanitize_filename("C:\\Users\\me\\build.zip"), "build.zip");
/// assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
/// assert_eq!(sanitize_filename("dir/"), "dir");
/// ```
pub fn sanitize_filename(raw: &str) -> String {
    raw.split(['/', '\\']).filter(|segment| !segment.is_empty()).last().unwrap_or_default().trim().to_string()
}

/// Checks that a name can be used verbatim as a single directory entry.
///
/// Rejects empty names, `.`/`..`, hidden names (the store keeps its own
/// scratch entries hidden), separators, null bytes and overly long names.
pub fn validate_filename(name: &str) -> Result<&str> {
    if !is_safe_component(name) || name.len() > MAX_FILENAME_LEN {
        exn::bail!(ErrorKind::InvalidFilename(name.to_string()));
    }
    Ok(name)
}

/// Returns `true` if `name` is exactly one normal, non-hidden path component.
///
/// Shared with configuration validation so category names obey the same
/// rules as artifact names.
pub fn is_safe_component(name: &str) -> bool {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!((components.next(), components.next()), (Some(Component::Normal(_)), None))
}

/// The extension of `name` including the leading dot, lowercased.
///
/// Mirrors what most people expect: `build.tar.gz` has the extension `.gz`,
/// and a name without a dot has none.
pub fn extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("build.zip", "build.zip")]
    #[case("nested/dir/build.zip", "build.zip")]
    #[case("..\\..\\windows\\build.zip", "build.zip")]
    #[case("../../etc/passwd", "passwd")]
    #[case("trailing/", "trailing")]
    #[case("  spaced.zip  ", "spaced.zip")]
    #[case("", "")]
    #[case("///", "")]
    fn test_sanitize(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sanitize_filename(raw), expected);
    }

    #[rstest]
    #[case("build.zip")]
    #[case("lineage-21.0-20240101-UNOFFICIAL.zip")]
    #[case("with space.zip")]
    fn test_valid_filenames(#[case] name: &str) {
        assert_eq!(validate_filename(name).unwrap(), name);
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("..")]
    #[case(".hidden.zip")]
    #[case("a/b.zip")]
    #[case("a\\b.zip")]
    #[case("a\0b.zip")]
    fn test_invalid_filenames(#[case] name: &str) {
        let err = validate_filename(name).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidFilename(_)));
    }

    #[test]
    fn test_overly_long_filename() {
        let name = format!("{}.zip", "a".repeat(MAX_FILENAME_LEN));
        assert!(validate_filename(&name).is_err());
    }

    #[rstest]
    #[case("build.zip", Some(".zip"))]
    #[case("BUILD.ZIP", Some(".zip"))]
    #[case("archive.tar.gz", Some(".gz"))]
    #[case("README", None)]
    #[case("trailing.", None)]
    #[case(".zip", None)]
    fn test_extension(#[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(extension(name).as_deref(), expected);
    }
}
