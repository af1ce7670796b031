//! Manifest resolution with a TTL cache.
//!
//! Resolved manifests are cached per reference. Entries expire after a TTL
//! that defaults to `ResolverConfig::ttl` and can be overridden per registry
//! host; a TTL of zero disables caching for that host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::image::{ImageReference, Manifest};
use crate::registry::{RegistryError, SharedRegistry};

/// Errors from manifest resolution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("image not found: {0}")]
    NotFound(String),

    #[error("registry rejected credentials: {0}")]
    AuthFailure(String),

    /// Network failure or 5xx. The caller may retry.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("manifest resolution timed out for {0}")]
    Timeout(String),

    #[error("invalid manifest for {reference}: {message}")]
    Invalid { reference: String, message: String },
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResolveError::RegistryUnavailable(_) | ResolveError::Timeout(_)
        )
    }

    fn from_registry(reference: &ImageReference, err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => ResolveError::NotFound(reference.to_string()),
            RegistryError::AuthFailure(msg) => ResolveError::AuthFailure(msg),
            RegistryError::Unavailable(msg) => ResolveError::RegistryUnavailable(msg),
            RegistryError::Timeout => ResolveError::Timeout(reference.to_string()),
            RegistryError::RangeNotSatisfiable { offset } => ResolveError::RegistryUnavailable(
                format!("unexpected range error at offset {offset}"),
            ),
            RegistryError::Rejected { status, message } => ResolveError::Invalid {
                reference: reference.to_string(),
                message: format!("HTTP {status}: {message}"),
            },
            RegistryError::InvalidManifest(message) => ResolveError::Invalid {
                reference: reference.to_string(),
                message,
            },
        }
    }
}

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Default freshness of a cached manifest.
    pub ttl: Duration,
    /// TTL per registry host.
    pub ttl_overrides: HashMap<String, Duration>,
    /// Upper bound on one registry round trip.
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            ttl_overrides: HashMap::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ResolverConfig {
    /// TTL that applies to `reference`.
    pub fn ttl_for(&self, reference: &ImageReference) -> Duration {
        self.ttl_overrides
            .get(reference.registry())
            .copied()
            .unwrap_or(self.ttl)
    }
}

/// Resolves image references to manifests, caching results.
pub struct ManifestResolver {
    registry: SharedRegistry,
    config: ResolverConfig,
    cache: RwLock<HashMap<ImageReference, Manifest>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ManifestResolver {
    pub fn new(registry: SharedRegistry, config: ResolverConfig) -> Self {
        Self {
            registry,
            config,
            cache: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Returns the manifest for `reference`, from cache when fresh.
    #[instrument(skip(self), fields(reference = %reference))]
    pub async fn resolve(&self, reference: &ImageReference) -> Result<Manifest, ResolveError> {
        if let Some(manifest) = self.cache.read().get(reference) {
            if !manifest.is_expired() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(manifest.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let layers = match tokio::time::timeout(
            self.config.timeout,
            self.registry.resolve_manifest(reference),
        )
        .await
        {
            Ok(Ok(layers)) => layers,
            Ok(Err(e)) => {
                let err = ResolveError::from_registry(reference, e);
                warn!(error = %err, "Manifest resolution failed");
                return Err(err);
            }
            Err(_) => return Err(ResolveError::Timeout(reference.to_string())),
        };

        if layers.is_empty() {
            return Err(ResolveError::Invalid {
                reference: reference.to_string(),
                message: "manifest has no layers".to_string(),
            });
        }

        let manifest = Manifest {
            reference: reference.clone(),
            layers,
            resolved_at: Instant::now(),
            ttl: self.config.ttl_for(reference),
        };
        debug!(
            layers = manifest.layers.len(),
            total_size = manifest.total_layer_size(),
            "Resolved manifest"
        );

        if !manifest.ttl.is_zero() {
            self.cache.write().insert(reference.clone(), manifest.clone());
        }
        Ok(manifest)
    }

    /// Drops the cached manifest for `reference`. Returns true if one was
    /// cached.
    pub fn invalidate(&self, reference: &ImageReference) -> bool {
        self.cache.write().remove(reference).is_some()
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, m| !m.is_expired());
        before - cache.len()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
