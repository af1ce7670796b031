//! Manifests and layer descriptors.
//!
//! [`OciManifest`] and [`OciIndex`] are the wire documents served by a
//! registry; [`Manifest`] is the resolved, cached form the rest of the agent
//! works with.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::digest::Digest;
use super::reference::ImageReference;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// One layer of an image. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    /// Content digest, the dedup key.
    pub digest: Digest,
    /// Declared size in bytes.
    pub size: u64,
    /// Media type of the layer blob.
    pub media_type: String,
}

impl LayerDescriptor {
    pub fn new(digest: Digest, size: u64, media_type: impl Into<String>) -> Self {
        Self {
            digest,
            size,
            media_type: media_type.into(),
        }
    }
}

/// A resolved manifest held by the resolver cache.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// The reference this manifest was resolved from.
    pub reference: ImageReference,
    /// Layers in application order.
    pub layers: Vec<LayerDescriptor>,
    /// When the registry answered.
    pub resolved_at: Instant,
    /// How long the entry stays fresh.
    pub ttl: Duration,
}

impl Manifest {
    /// Returns true once the TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        self.resolved_at.elapsed() >= self.ttl
    }

    /// Total declared size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// OCI image manifest (also accepts Docker schema 2).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: LayerDescriptor,
    pub layers: Vec<LayerDescriptor>,
}

/// OCI image index / Docker manifest list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<PlatformDescriptor>,
}

/// Index entry pointing at a per-platform manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }
}

impl OciIndex {
    /// Picks the entry for `platform`, ignoring the variant if none matches exactly.
    pub fn select(&self, platform: &Platform) -> Option<&PlatformDescriptor> {
        let matches_base = |d: &&PlatformDescriptor| {
            d.platform
                .as_ref()
                .is_some_and(|p| p.os == platform.os && p.architecture == platform.architecture)
        };
        self.manifests
            .iter()
            .filter(matches_base)
            .find(|d| d.platform.as_ref().map(|p| &p.variant) == Some(&platform.variant))
            .or_else(|| self.manifests.iter().find(matches_base))
    }
}

/// Returns true if the media type names an index rather than an image manifest.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}
