//! Identifier types.

use crate::define_id;

define_id!(
    /// A node that runs a coordinator and a local layer cache.
    NodeId,
    "node"
);

define_id!(
    /// One pull job: a set of images to make resident on one node.
    JobId,
    "job"
);

define_id!(
    /// A cluster-wide prefetch campaign made of many pull jobs.
    CampaignId,
    "cmp"
);
