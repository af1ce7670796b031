//! layercast node agent library.
//!
//! Keeps image layers resident in a node-local, content-addressed cache
//! ahead of the workloads that need them.
//!
//! ## Architecture
//!
//! ```text
//! NodeCoordinator ── resolves ──> ManifestResolver ──> Registry
//!        │
//!        └── schedules ──> FetcherPool ── streams ──> Registry
//!                              │
//!                              └── writes ──> CacheStore
//! ```
//!
//! ## Modules
//!
//! - `cache`: content-addressed blob store with refcounts and eviction
//! - `resolver`: image reference to manifest resolution with a TTL cache
//! - `registry`: registry backends (HTTP, mirrors, in-memory mock)
//! - `fetcher`: bounded, deduplicating, resumable layer downloads
//! - `coordinator`: pull jobs over a desired image set
//! - `actors`: the actor framework the pool and coordinator run on

pub mod actors;
pub mod agent;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod fetcher;
pub mod image;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod resolver;

// Re-export commonly used types
pub use agent::{build_registry, AgentError, NodeAgent};
pub use cache::{CacheConfig, CacheHandle, CacheStore};
pub use coordinator::{JobHandle, JobStatus, NodeCoordinator, PullJob};
pub use fetcher::{FetcherConfig, FetcherPool};
pub use registry::MockRegistry;
pub use resolver::ManifestResolver;
