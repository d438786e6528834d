//! Placement-oracle contract.
//!
//! The oracle is the pluggable low-level placer: given a candidate mask
//! and node-count bounds it either returns a concrete selection with a
//! per-node resource layout, or reports that nothing fits. The candidate
//! mask is passed **by value**: the oracle consumes it (historically it
//! shrank the caller's bitmap in place), so probing code keeps its own
//! backup copy.

use thiserror::Error;
use tracing::debug;

use ns_core::{ClusterState, JobId, JobLayout, JobRecord, NodeId, NodeMask};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SelectMode {
    /// Select and prepare to run immediately.
    RunNow,
    /// Feasibility only; no allocation side effects.
    TestOnly,
    /// Estimate when the job could run.
    WillRun,
}

/// A running job the picker offers up for preemption.
#[derive(Clone, Debug)]
pub struct PreempteeCandidate {
    pub job: JobId,
    pub node_mask: NodeMask,
    pub priority: u32,
}

/// A concrete placement.
#[derive(Clone, Debug)]
pub struct Placement {
    pub selection: NodeMask,
    pub cpu_count: u32,
    pub layout: JobLayout,
    /// Candidates whose nodes the selection claims.
    pub preemptees: Vec<JobId>,
}

#[derive(Clone, Debug)]
pub enum PlacementVerdict {
    Fit(Placement),
    NoFit,
}

#[derive(Clone, Debug, Error)]
#[error("placement oracle failure: {0}")]
pub struct OracleError(pub String);

pub trait PlacementOracle {
    /// Whether the oracle tracks consumable resources (CPU/memory level
    /// sharing) rather than whole nodes.
    fn consumable_resources(&self) -> bool;

    /// Score `candidates` for the job. Ownership of the mask moves to the
    /// oracle; callers that need it afterwards must clone first.
    #[allow(clippy::too_many_arguments)]
    fn job_test(
        &mut self,
        cluster: &ClusterState,
        job: &JobRecord,
        candidates: NodeMask,
        min_nodes: u32,
        max_nodes: u32,
        req_nodes: u32,
        mode: SelectMode,
        preemptees: &[PreempteeCandidate],
    ) -> PlacementVerdict;

    /// Called once after the allocation is committed.
    fn job_begin(&mut self, job: &JobRecord) -> Result<(), OracleError>;

    /// Called when the job's nodes are deallocated.
    fn job_fini(&mut self, job: &JobRecord) -> Result<(), OracleError>;
}

/// Reference oracle: whole-node, lowest-index-first placement.
///
/// Picks the job's required nodes, then fills from the candidate mask in
/// index order until the requested node count and the job's total CPU
/// minimum are both met. No consumable-resource tracking.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearOracle;

impl LinearOracle {
    fn node_cpus(cluster: &ClusterState, index: usize) -> u32 {
        let node = &cluster.nodes[index];
        if cluster.fast_schedule {
            cluster.config(node.config).cpus
        } else {
            node.cpus
        }
    }
}

impl PlacementOracle for LinearOracle {
    fn consumable_resources(&self) -> bool {
        false
    }

    fn job_test(
        &mut self,
        cluster: &ClusterState,
        job: &JobRecord,
        candidates: NodeMask,
        min_nodes: u32,
        max_nodes: u32,
        req_nodes: u32,
        mode: SelectMode,
        preemptees: &[PreempteeCandidate],
    ) -> PlacementVerdict {
        let _ = mode; // whole-node placement is side-effect free either way
        let target = req_nodes.clamp(min_nodes, max_nodes.max(min_nodes));

        let mut selection = NodeMask::new(candidates.len());
        let mut cpu_count = 0u32;
        let mut node_cpus: Vec<(NodeId, u32)> = Vec::new();

        // Required nodes are non-negotiable.
        if let Some(req) = &job.details.req_node_mask {
            if !req.is_subset_of(&candidates) {
                return PlacementVerdict::NoFit;
            }
            for i in req.ones() {
                let cpus = Self::node_cpus(cluster, i);
                selection.set(i);
                cpu_count += cpus;
                node_cpus.push((NodeId::new(i as u32), cpus));
            }
        }

        for i in candidates.ones() {
            let enough_nodes = selection.count() >= target;
            let enough_cpus = cpu_count >= job.details.min_cpus;
            if enough_nodes && enough_cpus {
                break;
            }
            if selection.count() >= max_nodes && max_nodes > 0 {
                break;
            }
            if selection.test(i) {
                continue;
            }
            let cpus = Self::node_cpus(cluster, i);
            selection.set(i);
            cpu_count += cpus;
            node_cpus.push((NodeId::new(i as u32), cpus));
        }

        let picked = selection.count();
        if picked < min_nodes
            || cpu_count < job.details.min_cpus
            || (max_nodes > 0 && picked > max_nodes)
        {
            return PlacementVerdict::NoFit;
        }

        node_cpus.sort_by_key(|(id, _)| *id);
        let preempted: Vec<JobId> = preemptees
            .iter()
            .filter(|c| c.node_mask.overlaps(&selection))
            .map(|c| c.job)
            .collect();
        debug!(job = %job.id, nodes = picked, cpus = cpu_count, "linear placement");
        PlacementVerdict::Fit(Placement {
            selection,
            cpu_count,
            layout: JobLayout { node_cpus },
            preemptees: preempted,
        })
    }

    fn job_begin(&mut self, _job: &JobRecord) -> Result<(), OracleError> {
        Ok(())
    }

    fn job_fini(&mut self, _job: &JobRecord) -> Result<(), OracleError> {
        Ok(())
    }
}
