//! In-memory registry with fault injection.
//!
//! Used by the test suites and for running the agent without network access.
//! Every blob request is counted per digest, so callers can assert how many
//! network fetches actually happened.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;

use super::{BlobStream, Registry, RegistryError};
use crate::image::{Digest, ImageReference, LayerDescriptor, ReferenceError};

const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// A one-shot failure applied to the next matching request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a retryable error (like a 503).
    Unavailable,
    /// Never answer; the caller's timeout has to fire.
    Stall,
    /// Serve this many bytes, then reset the connection.
    DisconnectAfter(usize),
    /// Serve the blob with its first byte flipped.
    Corrupt,
    /// Ignore the requested range and serve from offset 0.
    IgnoreRange,
    NotFound,
    AuthFailure,
}

#[derive(Default)]
struct MockState {
    manifests: HashMap<String, Vec<LayerDescriptor>>,
    blobs: HashMap<Digest, Bytes>,
    manifest_faults: HashMap<String, VecDeque<Fault>>,
    blob_faults: HashMap<Digest, VecDeque<Fault>>,
    /// Offsets requested per digest, in call order.
    blob_requests: HashMap<Digest, Vec<u64>>,
    manifest_requests: usize,
}

pub struct MockRegistry {
    name: String,
    state: Mutex<MockState>,
    latency: Duration,
    chunk_size: usize,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRegistry {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            state: Mutex::new(MockState::default()),
            latency: Duration::ZERO,
            chunk_size: 4096,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Delay applied before every blob response.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Size of the chunks blob bodies are split into.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Stores a blob and returns its descriptor.
    pub fn add_blob(&self, content: impl AsRef<[u8]>) -> LayerDescriptor {
        let bytes = Bytes::copy_from_slice(content.as_ref());
        let descriptor = LayerDescriptor::new(
            Digest::sha256_of(&bytes),
            bytes.len() as u64,
            LAYER_MEDIA_TYPE,
        );
        self.state
            .lock()
            .blobs
            .insert(descriptor.digest.clone(), bytes);
        descriptor
    }

    /// Registers an image whose layers have the given contents.
    pub fn add_image<B: AsRef<[u8]>>(
        &self,
        reference: &str,
        layers: &[B],
    ) -> Result<Vec<LayerDescriptor>, ReferenceError> {
        let reference = ImageReference::parse(reference)?;
        let descriptors: Vec<_> = layers.iter().map(|l| self.add_blob(l)).collect();
        self.state
            .lock()
            .manifests
            .insert(reference.to_string(), descriptors.clone());
        Ok(descriptors)
    }

    /// Registers an image with explicit descriptors (blobs may be absent).
    pub fn set_manifest(&self, reference: &ImageReference, layers: Vec<LayerDescriptor>) {
        self.state
            .lock()
            .manifests
            .insert(reference.to_string(), layers);
    }

    /// Queues a fault for the next request of `digest`.
    pub fn inject_blob_fault(&self, digest: &Digest, fault: Fault) {
        self.state
            .lock()
            .blob_faults
            .entry(digest.clone())
            .or_default()
            .push_back(fault);
    }

    /// Queues a fault for the next manifest request of `reference`.
    pub fn inject_manifest_fault(&self, reference: &ImageReference, fault: Fault) {
        self.state
            .lock()
            .manifest_faults
            .entry(reference.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Number of blob requests made for `digest`.
    pub fn blob_fetch_count(&self, digest: &Digest) -> usize {
        self.state
            .lock()
            .blob_requests
            .get(digest)
            .map_or(0, Vec::len)
    }

    /// Offsets requested for `digest`, in call order.
    pub fn blob_offsets(&self, digest: &Digest) -> Vec<u64> {
        self.state
            .lock()
            .blob_requests
            .get(digest)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of blob requests across all digests.
    pub fn total_blob_fetches(&self) -> usize {
        self.state.lock().blob_requests.values().map(Vec::len).sum()
    }

    /// Number of distinct digests requested at least once.
    pub fn distinct_blobs_fetched(&self) -> usize {
        self.state.lock().blob_requests.len()
    }

    pub fn manifest_fetch_count(&self) -> usize {
        self.state.lock().manifest_requests
    }

    /// Highest number of blob responses open at the same time.
    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn apply_fault(fault: &Fault, subject: &str) -> Option<RegistryError> {
        match fault {
            Fault::Unavailable => Some(RegistryError::Unavailable(format!(
                "{subject}: injected 503"
            ))),
            Fault::NotFound => Some(RegistryError::NotFound(subject.to_string())),
            Fault::AuthFailure => Some(RegistryError::AuthFailure(format!(
                "{subject}: injected 401"
            ))),
            _ => None,
        }
    }
}

/// Decrements the open-response gauge when the body stream is dropped.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Registry for MockRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<Vec<LayerDescriptor>, RegistryError> {
        let key = reference.to_string();
        let (fault, layers) = {
            let mut state = self.state.lock();
            state.manifest_requests += 1;
            let fault = state
                .manifest_faults
                .get_mut(&key)
                .and_then(VecDeque::pop_front);
            (fault, state.manifests.get(&key).cloned())
        };

        match fault {
            Some(Fault::Stall) => futures_util::future::pending::<()>().await,
            Some(fault) => {
                if let Some(err) = Self::apply_fault(&fault, &key) {
                    return Err(err);
                }
            }
            None => {}
        }

        layers.ok_or(RegistryError::NotFound(key))
    }

    async fn fetch_blob_range(
        &self,
        _reference: &ImageReference,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobStream, RegistryError> {
        let (fault, blob) = {
            let mut state = self.state.lock();
            state
                .blob_requests
                .entry(digest.clone())
                .or_default()
                .push(offset);
            let fault = state
                .blob_faults
                .get_mut(digest)
                .and_then(VecDeque::pop_front);
            (fault, state.blobs.get(digest).cloned())
        };

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if fault == Some(Fault::Stall) {
            futures_util::future::pending::<()>().await;
        }
        if let Some(err) = fault.as_ref().and_then(|f| Self::apply_fault(f, digest.as_str())) {
            return Err(err);
        }

        let blob = blob.ok_or_else(|| RegistryError::NotFound(digest.to_string()))?;
        let start = if fault == Some(Fault::IgnoreRange) { 0 } else { offset };
        if start > blob.len() as u64 {
            return Err(RegistryError::RangeNotSatisfiable { offset });
        }

        let mut data = blob.slice(start as usize..).to_vec();
        if fault == Some(Fault::Corrupt) {
            if let Some(first) = data.first_mut() {
                *first ^= 0xff;
            }
        }

        let mut reset = None;
        if let Some(Fault::DisconnectAfter(limit)) = fault {
            if limit < data.len() {
                data.truncate(limit);
                reset = Some(RegistryError::Unavailable("connection reset by peer".into()));
            }
        }

        let mut items: Vec<Result<Bytes, RegistryError>> = data
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        items.extend(reset.map(Err));

        let body = stream::iter(items)
            .map(move |item| {
                let _open = &guard;
                item
            })
            .boxed();

        Ok(BlobStream {
            offset: start,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(stream: BlobStream) -> (u64, Vec<u8>, Option<RegistryError>) {
        let offset = stream.offset;
        let mut body = stream.body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e) => return (offset, out, Some(e)),
            }
        }
        (offset, out, None)
    }

    #[tokio::test]
    async fn test_serves_ranges_and_counts() {
        let registry = MockRegistry::new().with_chunk_size(3);
        let layers = registry.add_image("app:v1", &["abcdefgh"]).unwrap();
        let reference = ImageReference::parse("app:v1").unwrap();
        let digest = &layers[0].digest;

        let (offset, body, err) = collect(
            registry.fetch_blob_range(&reference, digest, 5).await.unwrap(),
        )
        .await;
        assert_eq!(offset, 5);
        assert_eq!(body, b"fgh");
        assert!(err.is_none());
        assert_eq!(registry.blob_offsets(digest), vec![5]);
        assert_eq!(registry.max_concurrent_fetches(), 1);
    }

    #[tokio::test]
    async fn test_faults_apply_once() {
        let registry = MockRegistry::new();
        let layers = registry.add_image("app:v1", &["payload"]).unwrap();
        let reference = ImageReference::parse("app:v1").unwrap();
        let digest = &layers[0].digest;

        registry.inject_blob_fault(digest, Fault::DisconnectAfter(3));
        registry.inject_blob_fault(digest, Fault::Unavailable);

        let (_, body, err) =
            collect(registry.fetch_blob_range(&reference, digest, 0).await.unwrap()).await;
        assert_eq!(body, b"pay");
        assert!(err.unwrap().is_retryable());

        let err = registry
            .fetch_blob_range(&reference, digest, 3)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let (offset, body, err) =
            collect(registry.fetch_blob_range(&reference, digest, 3).await.unwrap()).await;
        assert_eq!(offset, 3);
        assert_eq!(body, b"load");
        assert!(err.is_none());
        assert_eq!(registry.blob_fetch_count(digest), 3);
    }

    #[tokio::test]
    async fn test_unknown_manifest_is_not_found() {
        let registry = MockRegistry::new();
        let reference = ImageReference::parse("missing:v1").unwrap();
        let err = registry.resolve_manifest(&reference).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
        assert_eq!(registry.manifest_fetch_count(), 1);
    }
}
