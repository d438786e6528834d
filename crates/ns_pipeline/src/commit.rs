//! Allocation commit: job → RUNNING, nodes → ALLOCATED, licenses claimed,
//! prolog fired.

use tracing::{error, info};

use ns_algo::{PickSuccess, PlacementOracle};
use ns_core::{JobRecord, JobState, NodeId, PartitionRecord, SelectionError, StateReason, INFINITE};

use crate::Controller;

impl<O: PlacementOracle> Controller<O> {
    /// Commit a successful pick. On oracle refusal the job stays queued
    /// and the caller sees busy.
    pub(crate) fn commit_allocation(
        &mut self,
        job: &mut JobRecord,
        part: &PartitionRecord,
        picked: PickSuccess,
        now: i64,
    ) -> Result<(), SelectionError> {
        // A requeued job may carry vestigial allocation state.
        job.node_mask = None;
        job.node_names.clear();
        job.node_addrs.clear();
        job.batch_host = None;

        job.start_time = now;
        if job.time_limit.is_none() {
            job.time_limit = Some(part.default_time.unwrap_or(part.max_time));
        }
        job.end_time = match job.time_limit {
            Some(INFINITE) | None => now + 365 * 24 * 60 * 60,
            Some(minutes) => now + i64::from(minutes) * 60,
        };

        if let Err(e) = self.oracle.job_begin(job) {
            // Leave the job queued; something is hosed downstream.
            error!(job = %job.id, error = %e, "select_job_begin failed");
            job.start_time = 0;
            job.end_time = 0;
            return Err(SelectionError::NodesBusy);
        }

        job.state_reason = StateReason::None;
        job.node_mask = Some(picked.mask.clone());
        job.total_cpus = picked.cpu_count;
        job.cpu_cnt = picked.cpu_count;

        // Node list from the oracle's layout when it produced one,
        // otherwise derived from the bitmap.
        job.node_names = if picked.layout.node_cpus.is_empty() {
            picked
                .mask
                .ones()
                .map(|i| self.cluster.nodes[i].name.clone())
                .collect()
        } else {
            picked
                .layout
                .node_ids()
                .map(|id| self.cluster.node(id).name.clone())
                .collect()
        };
        job.resources = Some(picked.layout);

        self.allocate_nodes(job);
        self.build_node_details(job);

        job.state = JobState::Running;
        // Powered-down members must boot before the job truly starts.
        job.configuring = picked.mask.overlaps(&self.cluster.power_mask);
        info!(
            job = %job.id,
            nodes = job.node_cnt,
            cpus = job.total_cpus,
            "allocation committed; firing prolog"
        );
        Ok(())
    }

    /// Flip every allocated node's state and claim the job's licenses.
    pub(crate) fn allocate_nodes(&mut self, job: &mut JobRecord) {
        let exclusive = !job.resolved_share.is_shared();
        let Some(mask) = job.node_mask.clone() else {
            return;
        };
        for i in mask.ones() {
            self.cluster.make_node_alloc(NodeId::new(i as u32), exclusive);
            if job.batch_host.is_none() {
                job.batch_host = Some(self.cluster.nodes[i].name.clone());
            }
        }
        self.cluster.license_claim(job);
    }

    /// Derive per-node addresses for the allocation, in node-index order.
    pub(crate) fn build_node_details(&self, job: &mut JobRecord) {
        let Some(mask) = &job.node_mask else {
            job.node_cnt = 0;
            job.node_addrs.clear();
            return;
        };
        job.node_cnt = mask.count();
        job.node_addrs = mask
            .ones()
            .map(|i| self.cluster.nodes[i].addr.clone())
            .collect();
    }
}
