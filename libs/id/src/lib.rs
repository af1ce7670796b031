//! # layercast-id
//!
//! Identifiers shared by the node agent and the cluster scheduler.
//!
//! Every identifier is `{prefix}_{ulid}`, for example
//! `node_01HV4Z2WQXKJNM8GPQY6VBKC3D` or `job_01HV4Z3MXNKPQR9HSTZ7WCLD4E`.
//! The prefix keeps a job id from being passed where a node id is expected,
//! and the ULID keeps ids sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
