//! Storage models.
//!
//! These types are what the store hands back to callers: artifact metadata
//! for listings and per-category summaries for the admin view.

use std::path::PathBuf;
use time::OffsetDateTime;
use time::macros::format_description;

/// A stored artifact.
///
/// The download count is never cached alongside the rest; it is filled in
/// from the live counter every time a listing is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Category (directory) the artifact lives in
    pub category: String,
    /// Base name of the file inside the category directory
    pub filename: String,
    /// File size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
    /// Number of recorded downloads
    pub downloads: u64,
}
impl Artifact {
    pub fn new(category: impl Into<String>, filename: impl Into<String>, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            category: category.into(),
            filename: filename.into(),
            size,
            modified,
            downloads: 0,
        }
    }

    pub fn with_downloads(mut self, downloads: u64) -> Self {
        self.downloads = downloads;
        self
    }

    /// Path of the artifact relative to the upload root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.category).join(&self.filename)
    }

    /// Human readable size, e.g. `1.5 MB`.
    pub fn human_size(&self) -> String {
        format_size(self.size)
    }

    /// Modification time as `YYYY-MM-DD HH:MM` in UTC.
    pub fn updated_at(&self) -> String {
        let format = format_description!("[year]-[month]-[day] [hour]:[minute]");
        self.modified
            .to_offset(time::UtcOffset::UTC)
            .format(&format)
            .unwrap_or_else(|_| self.modified.unix_timestamp().to_string())
    }
}

/// Settings and live file count of one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryInfo {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub max_files: usize,
    pub file_count: usize,
}

/// Format a byte count with binary multiples and one decimal place.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < 2 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}", bytes as f64 / div as f64, ["KB", "MB", "GB"][exp])
}
