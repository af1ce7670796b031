//! Image data model: digests, references, manifests and layer descriptors.

mod digest;
mod manifest;
mod reference;

pub use digest::{Digest, DigestError};
pub use manifest::{
    is_index_media_type, LayerDescriptor, Manifest, OciIndex, OciManifest, Platform,
    PlatformDescriptor, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
pub use reference::{ImageReference, Reference, ReferenceError, DEFAULT_REGISTRY};
