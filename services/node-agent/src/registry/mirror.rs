//! Ordered fallback across several registry backends.
//!
//! Typical use is one or more pull-through mirrors in front of the upstream
//! registry: mirrors absorb most of the load, upstream answers what they miss.
//! Blobs are content-addressed, so a download resumed on a different backend
//! still produces the same bytes.

use async_trait::async_trait;
use tracing::debug;

use super::{BlobStream, Registry, RegistryError, SharedRegistry};
use crate::image::{Digest, ImageReference, LayerDescriptor};

pub struct MirrorRegistry {
    name: String,
    backends: Vec<SharedRegistry>,
}

impl MirrorRegistry {
    /// Backends are tried in order; put upstream last.
    pub fn new(backends: Vec<SharedRegistry>) -> Self {
        let name = backends
            .iter()
            .map(|b| b.name())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            name: format!("mirror[{name}]"),
            backends,
        }
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }
}

#[async_trait]
impl Registry for MirrorRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<Vec<LayerDescriptor>, RegistryError> {
        let mut last_error = RegistryError::Unavailable("no registry backends configured".into());
        for backend in &self.backends {
            match backend.resolve_manifest(reference).await {
                Ok(layers) => return Ok(layers),
                Err(e) => {
                    debug!(
                        backend = %backend.name(),
                        reference = %reference,
                        error = %e,
                        "Manifest backend failed, trying next"
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn fetch_blob_range(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobStream, RegistryError> {
        let mut last_error = RegistryError::Unavailable("no registry backends configured".into());
        for backend in &self.backends {
            match backend.fetch_blob_range(reference, digest, offset).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(
                        backend = %backend.name(),
                        digest = %digest,
                        error = %e,
                        "Blob backend failed, trying next"
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
