//! Bounded concurrency for uploads and downloads.

use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::ResultExt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The two kinds of work the gate admits, each with its own capacity.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Kind {
    #[display("upload")]
    Upload,
    #[display("download")]
    Download,
}

/// A held admission slot. Dropping it frees the slot, on every exit path.
#[derive(Debug)]
pub struct Slot {
    kind: Kind,
    _permit: OwnedSemaphorePermit,
}
impl Slot {
    pub fn kind(&self) -> Kind {
        self.kind
    }
}

/// Two counting semaphores: one for uploads, one for downloads.
///
/// Acquiring waits until a slot of that kind is free. There is no timeout
/// and no queue limit; callers that give up simply drop the future.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    uploads: Arc<Semaphore>,
    downloads: Arc<Semaphore>,
    upload_capacity: usize,
    download_capacity: usize,
}

impl AdmissionGate {
    pub fn new(uploads: usize, downloads: usize) -> Self {
        Self {
            uploads: Arc::new(Semaphore::new(uploads)),
            downloads: Arc::new(Semaphore::new(downloads)),
            upload_capacity: uploads,
            download_capacity: downloads,
        }
    }

    fn semaphore(&self, kind: Kind) -> &Arc<Semaphore> {
        match kind {
            Kind::Upload => &self.uploads,
            Kind::Download => &self.downloads,
        }
    }

    /// Wait for a free slot of `kind`.
    ///
    /// Fails only once the gate has been [closed](Self::close).
    pub async fn acquire(&self, kind: Kind) -> Result<Slot> {
        let permit = Arc::clone(self.semaphore(kind)).acquire_owned().await.or_raise(|| ErrorKind::Closed)?;
        tracing::trace!(%kind, available = self.available(kind), "Admitted");
        Ok(Slot { kind, _permit: permit })
    }

    /// Take a free slot of `kind` without waiting, if there is one.
    pub fn try_acquire(&self, kind: Kind) -> Option<Slot> {
        let permit = Arc::clone(self.semaphore(kind)).try_acquire_owned().ok()?;
        Some(Slot { kind, _permit: permit })
    }

    pub fn available(&self, kind: Kind) -> usize {
        self.semaphore(kind).available_permits()
    }

    pub fn capacity(&self, kind: Kind) -> usize {
        match kind {
            Kind::Upload => self.upload_capacity,
            Kind::Download => self.download_capacity,
        }
    }

    /// Stop admitting work. Waiting and future acquisitions fail with
    /// [`ErrorKind::Closed`]; slots already held stay valid.
    pub fn close(&self) {
        self.uploads.close();
        self.downloads.close();
        tracing::debug!("Admission gate closed");
    }

    pub fn is_closed(&self) -> bool {
        self.uploads.is_closed() && self.downloads.is_closed()
    }
}
