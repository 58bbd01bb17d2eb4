//! Download accounting errors.
//!
//! Counting itself never fails; only persisting the counters to disk can.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// The counter table could not be encoded.
    #[display("could not serialize download counts")]
    Serialize,
    /// The counter file could not be replaced.
    #[display("could not write download counts to {}", _0.display())]
    Persist(#[error(not(source))] PathBuf),
    /// The background writer went away mid-flush.
    #[display("download count writer was interrupted")]
    Interrupted,
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialize)
    }
}
