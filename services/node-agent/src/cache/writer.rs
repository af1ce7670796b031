//! Staged blob writes.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest as _, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::store::{AbortReason, StoreInner};
use super::CacheError;
use crate::image::Digest;

/// Exclusive claim on one digest while its bytes are being written.
///
/// Bytes go to a staging file and are hashed as they arrive. Nothing is
/// visible to readers until `CacheStore::commit` verifies and publishes the
/// blob. Dropping a writer without committing or aborting it discards the
/// partial bytes and releases the claim, so a cancelled download cannot
/// leak the per-digest lock.
pub struct BlobWriter {
    inner: Arc<StoreInner>,
    id: u64,
    digest: Digest,
    expected_size: u64,
    staging: PathBuf,
    file: Option<File>,
    hasher: Sha256,
    written: u64,
    finished: bool,
}

impl BlobWriter {
    pub(super) fn new(
        inner: Arc<StoreInner>,
        id: u64,
        digest: Digest,
        expected_size: u64,
        staging: PathBuf,
        file: File,
    ) -> Self {
        Self {
            inner,
            id,
            digest,
            expected_size,
            staging,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
            finished: false,
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    /// Bytes confirmed written so far; the offset to resume from.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends a chunk.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        let actual = self.written + chunk.len() as u64;
        if actual > self.expected_size {
            return Err(CacheError::SizeMismatch {
                digest: self.digest.clone(),
                expected: self.expected_size,
                actual,
            });
        }
        if self.written == 0 && !chunk.is_empty() {
            self.inner.mark_downloading(self.id, &self.digest);
        }

        let file = self.file.as_mut().ok_or_else(closed)?;
        file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written = actual;
        Ok(())
    }

    /// Discards everything written so far and starts over at offset 0.
    pub async fn reset(&mut self) -> Result<(), CacheError> {
        let file = self.file.as_mut().ok_or_else(closed)?;
        file.set_len(0).await?;
        file.seek(SeekFrom::Start(0)).await?;
        self.hasher = Sha256::new();
        self.written = 0;
        debug!(digest = %self.digest, "Reset staged write");
        Ok(())
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// Flushes and closes the staging file.
    pub(super) async fn close(&mut self) -> Result<(), CacheError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Digest of the bytes written so far. Consumes the running hash.
    pub(super) fn finish_hash(&mut self) -> Digest {
        Digest::from_hasher(std::mem::take(&mut self.hasher))
    }

    /// Marks the writer as settled so `Drop` leaves the index alone.
    pub(super) fn settle(&mut self) {
        self.finished = true;
        self.file = None;
    }
}

impl std::fmt::Debug for BlobWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobWriter")
            .field("digest", &self.digest)
            .field("expected_size", &self.expected_size)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.file = None;
        if let Err(e) = std::fs::remove_file(&self.staging) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.staging.display(), error = %e, "Failed to remove staging file");
            }
        }
        self.inner
            .abandon(self.id, &self.digest, self.expected_size, AbortReason::Cancelled);
    }
}

fn closed() -> io::Error {
    io::Error::other("blob writer is closed")
}
