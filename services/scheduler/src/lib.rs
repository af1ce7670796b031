//! # layercast-scheduler
//!
//! Cluster-wide prefetch campaigns.
//!
//! A campaign is a batch of pull jobs, each aimed at one node. The scheduler
//! hands them to the nodes' coordinators while keeping the number of node
//! jobs running across the whole cluster under a fixed ceiling, so a large
//! rollout never turns into a stampede against the source registry.
//!
//! ```text
//! ClusterScheduler ──submit──▶ campaign runner ──NodeEndpoint::submit──▶ NodeCoordinator
//!        ▲                          │                                          │
//!        └──── CampaignStatus ◀─────┴────────────── JobStatus ◀────────────────┘
//! ```
//!
//! Node jobs are dispatched in priority order, optionally spread across a
//! stagger window. A node job that ends with retryable failures is run
//! again, up to a bounded number of attempts; after that it is reported
//! failed and stays in the aggregate.

mod campaign;
mod endpoint;
mod runner;
mod scheduler;

pub use campaign::{CampaignHandle, CampaignStatus, NodeJobStatus};
pub use endpoint::{EndpointError, NodeEndpoint};
pub use scheduler::{ClusterScheduler, SchedulerConfig, SchedulerError};
