//! Registry backends.
//!
//! The agent only needs two capabilities from a registry: resolve an image
//! reference to its layers, and stream a blob starting at a byte offset.
//! [`Registry`] is that seam. Implementations:
//!
//! - [`HttpRegistry`]: OCI distribution API over HTTPS, with static or
//!   token-exchange credentials
//! - [`MirrorRegistry`]: ordered fallback across several backends
//! - [`MockRegistry`]: in-memory backend with fault injection, for tests and
//!   local development

mod error;
mod http;
mod mirror;
mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::image::{Digest, ImageReference, LayerDescriptor};

pub use error::RegistryError;
pub use http::{Credentials, HttpRegistry, HttpRegistryConfig};
pub use mirror::MirrorRegistry;
pub use mock::{Fault, MockRegistry};

/// A streaming blob body.
pub struct BlobStream {
    /// Offset of the first byte the stream yields. A backend that cannot
    /// honour a range request reports 0 here and streams the whole blob.
    pub offset: u64,
    /// Chunks of blob content.
    pub body: BoxStream<'static, Result<Bytes, RegistryError>>,
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// Capability interface of a source registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Name for logs and metrics.
    fn name(&self) -> &str;

    /// Resolves a reference to its ordered layer list.
    async fn resolve_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<Vec<LayerDescriptor>, RegistryError>;

    /// Streams a blob of `reference`'s repository, starting at `offset`.
    async fn fetch_blob_range(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobStream, RegistryError>;
}

/// Shared handle to a registry backend.
pub type SharedRegistry = Arc<dyn Registry>;
