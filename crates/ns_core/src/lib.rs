//! ns_core — Core types for the node-selection engine.
//!
//! This crate is **I/O-free**. It defines the stable types/APIs used across
//! the engine (`ns_io`, `ns_algo`, `ns_pipeline`, `ns_cli`):
//!
//! - Registry indices: `NodeId`, `JobId`, `ConfigId`, `PartitionId`
//! - `NodeMask` population bitmaps and their operation set
//! - Node, configuration, partition and job records
//! - Feature expressions (`name`, combinator, count) with their parser
//! - `ClusterState`: the owned node table plus derived population bitmaps
//! - The closed selection error taxonomy (permanent vs transient)
//!
//! Cross-record references are registry indices, never owning pointers, so
//! record graphs stay cycle-free.

pub mod bitmap;
pub mod cluster;
pub mod errors;
pub mod feature;
pub mod ids;
pub mod job;
pub mod node;
pub mod partition;

pub use bitmap::NodeMask;
pub use cluster::{AvailOverlay, ClusterState, FeatureRegistry, License};
pub use errors::SelectionError;
pub use feature::{FeatureExpr, FeatureOp, FeatureParseError, FeatureTerm};
pub use ids::{ConfigId, JobId, NodeId, PartitionId};
pub use job::{
    CkptSupport, JobDetails, JobLayout, JobRecord, JobState, MemoryRequirement, MultiCoreSpec,
    PreemptMode, QosPolicy, ShareMode, ShareRequest, StateReason,
};
pub use node::{ConfigRecord, NodeFlags, NodeRecord, NodeState};
pub use partition::{PartitionRecord, PartitionState, SharePolicy};

/// Width of the per-configuration alternative bitmap: the maximum number of
/// mutually-exclusive feature alternatives one expression may carry.
pub const MAX_FEATURES: usize = 32;

/// Sentinel for "no time limit" (minutes).
pub const INFINITE: u32 = u32::MAX;
