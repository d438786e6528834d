//! ns_algo — Selection algorithms for the node-selection engine.
//!
//! Pure computation over `ns_core` types; no I/O, no clock. The modules
//! follow the selection call's data flow:
//!
//! - `share`: map (user request, partition policy, consumable resources)
//!   to the effective sharing mode
//! - `features`: evaluate a job's feature expression over the registry
//! - `node_sets`: group candidate nodes into weight-ordered sets
//! - `oracle`: the placement-oracle contract plus a linear reference
//!   implementation
//! - `pick`: the weight-ordered accumulate-and-probe loop

pub mod features;
pub mod node_sets;
pub mod oracle;
pub mod pick;
pub mod share;

pub use features::{evaluate_feature_counts, xor_alternatives};
pub use node_sets::{build_node_sets, job_req_node_filter, required_in_sets, NodeSet};
pub use oracle::{
    LinearOracle, OracleError, Placement, PlacementOracle, PlacementVerdict, PreempteeCandidate,
    SelectMode,
};
pub use pick::{pick_best_nodes, NodeCounts, PickFailure, PickSuccess};
pub use share::resolve_share;
