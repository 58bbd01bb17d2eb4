//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Validation failures are reported
//! before any I/O happens; everything from [`ErrorKind::Io`] downwards is a
//! storage fault that aborted the operation without touching existing
//! artifacts.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Category is not configured, or is disabled.
    #[display("unknown category: {_0}")]
    UnknownCategory(#[error(not(source))] String),
    /// Filename is empty, contains separators, or tries to traverse.
    #[display("invalid filename: {_0}")]
    InvalidFilename(#[error(not(source))] String),
    /// Filename extension is not in the configured allow-list.
    #[display("file extension not allowed: {_0}")]
    DisallowedExtension(#[error(not(source))] String),
    /// Uploaded content does not start with the signature its extension promises.
    #[display("content does not match the expected {_0} signature")]
    SignatureMismatch(#[error(not(source))] String),
    /// Artifact does not exist.
    #[display("artifact not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Required directories could not be created on startup.
    #[display("could not initialize storage directory: {}", _0.display())]
    Initialize(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// The scratch file for an upload could not be created or written.
    #[display("temporary upload file failed")]
    TempFile,
    /// Old artifacts could not be evicted to make room.
    #[display("retention for category {_0} failed")]
    Retention(#[error(not(source))] String),
    /// The finished upload could not be moved into its category.
    #[display("could not commit {}", _0.display())]
    Commit(#[error(not(source))] PathBuf),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::TempFile | Self::Retention(_) | Self::Commit(_))
    }

    /// Returns `true` for errors caused by the request rather than the server.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownCategory(_) | Self::InvalidFilename(_) | Self::DisallowedExtension(_) | Self::SignatureMismatch(_)
        )
    }
}
