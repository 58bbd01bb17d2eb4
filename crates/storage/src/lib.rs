//! Artifact storage.
//!
//! A local directory tree with one directory per category, holding artifacts
//! directly, plus a scratch directory for uploads in flight. The
//! [`ArtifactStore`] guarantees that a category never holds more than its
//! configured number of files and that nobody ever observes a half-written
//! artifact.

mod commit;
pub mod error;
mod listing;
mod models;
mod path;
mod retention;
mod settings;
pub mod signature;
mod store;

pub use crate::models::{Artifact, CategoryInfo, format_size};
pub use crate::path::{extension, is_safe_component, sanitize_filename, validate_filename};
pub use crate::settings::{Category, StoreSettings};
pub use crate::signature::{Format, PeekableUpload};
pub use crate::store::{ArtifactStore, Located};
pub use shelf_stats::DownloadCounter;
