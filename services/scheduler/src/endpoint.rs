//! The scheduler's view of a node.

use async_trait::async_trait;
use layercast_id::NodeId;
use layercast_node_agent::coordinator::CoordinatorError;
use layercast_node_agent::{JobHandle, NodeCoordinator, PullJob};
use thiserror::Error;

/// Errors from handing a job to a node.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    /// The node could not be reached; it may be back later.
    #[error("node {node} is unavailable: {reason}")]
    Unavailable { node: NodeId, reason: String },

    /// The node refused the job.
    #[error("node {node} rejected the job: {reason}")]
    Rejected { node: NodeId, reason: String },
}

impl EndpointError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// A node that accepts pull jobs.
#[async_trait]
pub trait NodeEndpoint: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Starts `job` on the node. The handle tracks it to completion.
    async fn submit(&self, job: PullJob) -> Result<JobHandle, EndpointError>;
}

#[async_trait]
impl NodeEndpoint for NodeCoordinator {
    fn node_id(&self) -> NodeId {
        NodeCoordinator::node_id(self)
    }

    async fn submit(&self, job: PullJob) -> Result<JobHandle, EndpointError> {
        let node = NodeCoordinator::node_id(self);
        NodeCoordinator::submit(self, job).await.map_err(|e| match e {
            CoordinatorError::Stopped => EndpointError::Unavailable {
                node,
                reason: e.to_string(),
            },
            other => EndpointError::Rejected {
                node,
                reason: other.to_string(),
            },
        })
    }
}
