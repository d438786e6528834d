//! `select_nodes`: the selection driver.
//!
//! Order of battle for one pending job:
//!
//! 1. Accounting predicate and the partition admission gate (state, time
//!    and node limits, QoS usage threshold, holds).
//! 2. Build the weight-ordered node sets (named reservations restrict the
//!    universe up front).
//! 3. Reconcile node-count bounds against the partition, then run the
//!    feature-count expansion and the final pick under the implicit
//!    reservation overlay.
//! 4. On success: preempt what the oracle asked for, then commit; if any
//!    victim was actioned the caller sees busy and retries next cycle.
//!
//! Failures stamp the job's pending reason; permanent kinds floor the
//! job's priority to 1 so it drifts to the back of the queue (held jobs
//! keep priority 0).

use tracing::{debug, error, info};

use ns_algo::{
    build_node_sets, pick_best_nodes, required_in_sets, NodeCounts, NodeSet, PickFailure,
    PickSuccess, PlacementOracle, PreempteeCandidate,
};
use ns_core::{
    AvailOverlay, ClusterState, JobId, JobRecord, NodeMask, PartitionRecord, PartitionState,
    QosPolicy, SelectionError, StateReason, INFINITE,
};

use crate::resv::ReservationDirectory;
use crate::{Controller, JobTable, SelectSuccess};

/// Hard cap on requested node counts, preventing arithmetic overflow from
/// unlimited partitions.
const MAX_REQ_NODES: u32 = 500_000;

impl<O: PlacementOracle> Controller<O> {
    /// Select and allocate nodes for a pending job. With `test_only` the
    /// feasibility answer is computed and the job is left untouched.
    pub fn select_nodes(
        &mut self,
        job_id: JobId,
        test_only: bool,
        now: i64,
    ) -> Result<SelectSuccess, SelectionError> {
        let Some(mut job) = self.jobs.take(job_id) else {
            error!(job = %job_id, "select for unknown job");
            return Err(SelectionError::InfeasibleConfig);
        };
        let result = self.select_inner(&mut job, test_only, now);
        self.jobs.insert(job);
        result
    }

    fn select_inner(
        &mut self,
        job: &mut JobRecord,
        test_only: bool,
        now: i64,
    ) -> Result<SelectSuccess, SelectionError> {
        if !job.acct_policy_ok {
            return Err(SelectionError::AccountingPolicy);
        }

        let part = self.cluster.partition(job.partition).clone();
        admission_gate(job, &part)?;

        // A named reservation fixes the usable universe before anything
        // else; denial is permanent.
        let usable = match &job.resv_name {
            Some(_) => match self.reservations.job_test_resv(job, now) {
                Ok((_start, mask)) => {
                    if let Some(req) = &job.details.req_node_mask {
                        if !req.is_subset_of(&mask) {
                            // Required nodes outside of the reservation.
                            job.state_reason = StateReason::Reservation;
                            permanent_floor(job);
                            return Err(SelectionError::InfeasibleConfig);
                        }
                    }
                    Some(mask)
                }
                Err(e) => {
                    job.state_reason = StateReason::Reservation;
                    if e.is_permanent() {
                        permanent_floor(job);
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        let mut sets = match build_node_sets(job, &part, &self.cluster, usable) {
            Ok(sets) => sets,
            Err(e) => return Err(record_failure(job, e)),
        };

        if let Some(req) = job.details.req_node_mask.clone() {
            if let Err(e) = required_in_sets(&req, &sets) {
                info!(job = %job.id, "no node sets satisfy the required node list");
                return Err(record_failure(job, e));
            }
        }

        // Enforce both the user's and the partition's node limits unless
        // QoS exempts them.
        let qos = job.qos.unwrap_or(QosPolicy::default());
        let details = &job.details;
        let min_nodes = if qos.exempt_part_min_nodes {
            details.min_nodes
        } else {
            details.min_nodes.max(part.min_nodes)
        };
        let mut max_nodes = if details.max_nodes == 0 {
            part.max_nodes
        } else if qos.exempt_part_max_nodes {
            details.max_nodes
        } else {
            details.max_nodes.min(part.max_nodes)
        };
        max_nodes = max_nodes.min(MAX_REQ_NODES);
        // Aim for the user's maximum when they chose one themselves; a
        // limit-derived maximum is a cap, not a request.
        let req_nodes = if !details.limit_set_max_nodes && details.max_nodes != 0 {
            max_nodes
        } else {
            min_nodes
        };
        if max_nodes < min_nodes {
            return Err(record_failure(job, SelectionError::PartConfigUnavailable));
        }

        let horizon = run_window_end(&part, job, now);
        let preemption_enabled = self.cluster.preemption_enabled;
        let Controller {
            cluster,
            oracle,
            reservations,
            jobs,
            ..
        } = self;
        let outcome = get_req_features(
            cluster,
            oracle,
            reservations,
            jobs,
            job,
            &part,
            &mut sets,
            NodeCounts {
                min: min_nodes,
                max: max_nodes,
                req: req_nodes,
            },
            test_only,
            now,
            horizon,
            preemption_enabled,
        );

        let picked = match outcome {
            Ok(picked) => picked,
            Err(PickFailure { error, possible }) => {
                if let Some(mask) = possible {
                    debug!(job = %job.id, waiting_on = mask.count(), "closest candidate population");
                }
                return Err(record_failure(job, error));
            }
        };

        if !test_only && !picked.preemptees.is_empty() {
            let actioned = self.preempt_jobs(&picked.preemptees, now);
            if actioned {
                // Victims need a cycle to clear out.
                return Err(record_failure(job, SelectionError::NodesBusy));
            }
        }

        if test_only {
            debug!(job = %job.id, "request feasible now; leaving job pending");
            let node_names = picked
                .mask
                .ones()
                .map(|i| self.cluster.nodes[i].name.clone())
                .collect();
            return Ok(SelectSuccess {
                nodes: picked.mask,
                node_names,
                cpu_count: picked.cpu_count,
                preempted: Vec::new(),
                test_only: true,
            });
        }

        let preempted = picked.preemptees.clone();
        self.commit_allocation(job, &part, picked, now)
            .map_err(|e| record_failure(job, e))?;
        Ok(SelectSuccess {
            nodes: job.node_mask.clone().unwrap_or_default(),
            node_names: job.node_names.clone(),
            cpu_count: job.total_cpus,
            preempted,
            test_only: false,
        })
    }
}

/// Partition/QoS admission checks. Failures stamp the pending reason;
/// held jobs keep priority 0, everything else permanent floors to 1.
fn admission_gate(job: &mut JobRecord, part: &PartitionRecord) -> Result<(), SelectionError> {
    let qos = job.qos.unwrap_or(QosPolicy::default());
    let mut failure: Option<(StateReason, SelectionError)> = None;

    if part.state == PartitionState::Down {
        failure = Some((StateReason::PartitionDown, SelectionError::PartitionDown));
    } else if part.state == PartitionState::Inactive {
        failure = Some((StateReason::PartitionInactive, SelectionError::PartitionDown));
    } else if job.priority == 0 {
        // User or administrator hold.
        failure = Some((StateReason::Held, SelectionError::JobHeld));
    } else if job.time_limit.is_some_and(|limit| limit > part.max_time)
        && !qos.exempt_part_time_limit
    {
        failure = Some((
            StateReason::PartitionTimeLimit,
            SelectionError::PartConfigUnavailable,
        ));
    } else if (job.details.max_nodes != 0
        && job.details.max_nodes < part.min_nodes
        && !qos.exempt_part_min_nodes)
        || (job.details.min_nodes > part.max_nodes && !qos.exempt_part_max_nodes)
    {
        failure = Some((StateReason::PartitionNodeLimit, SelectionError::PartNodeLimit));
    } else if let (Some(threshold), Some(factor)) = (qos.usage_threshold, job.fair_share_factor) {
        if factor < threshold {
            failure = Some((StateReason::QosUsageThreshold, SelectionError::QosThreshold));
        }
    }

    let Some((reason, error)) = failure else {
        return Ok(());
    };
    if job.is_held() {
        if job.state_reason != StateReason::Held && job.state_reason != StateReason::HeldUser {
            job.state_reason = StateReason::Held;
        }
        return Err(SelectionError::JobHeld);
    }
    job.state_reason = reason;
    if error.is_permanent() {
        permanent_floor(job);
    }
    Err(error)
}

/// Stamp a post-gate failure onto the job: pending reason plus the
/// permanent-failure priority floor.
fn record_failure(job: &mut JobRecord, error: SelectionError) -> SelectionError {
    job.state_reason = match error {
        SelectionError::PartConfigUnavailable | SelectionError::PartNodeLimit => {
            StateReason::PartitionNodeLimit
        }
        SelectionError::NodeNotAvail => StateReason::NodesRequiredDown,
        SelectionError::ReservationNotUsable => StateReason::Reservation,
        _ => StateReason::Resources,
    };
    if error.is_permanent() {
        permanent_floor(job);
    }
    error
}

fn permanent_floor(job: &mut JobRecord) {
    if job.priority != 0 {
        job.priority = 1;
    }
}

/// End of the job's expected run window, for reservation collision tests.
fn run_window_end(part: &PartitionRecord, job: &JobRecord, now: i64) -> i64 {
    const YEAR_MINUTES: u32 = 365 * 24 * 60;
    let minutes = part.effective_time_limit(job.time_limit);
    let capped = if minutes == INFINITE {
        YEAR_MINUTES
    } else {
        minutes.min(YEAR_MINUTES)
    };
    now + i64::from(capped) * 60
}

/// Running, lower-priority jobs the picker may offer to the oracle as
/// preemption victims.
fn find_preemptable(jobs: &JobTable, job: &JobRecord, enabled: bool) -> Vec<PreempteeCandidate> {
    if !enabled {
        return Vec::new();
    }
    jobs.iter()
        .filter(|victim| victim.is_running() || victim.state == ns_core::JobState::Suspended)
        .filter(|victim| victim.priority < job.priority)
        .filter_map(|victim| {
            victim.node_mask.as_ref().map(|mask| PreempteeCandidate {
                job: victim.id,
                node_mask: mask.clone(),
                priority: victim.priority,
            })
        })
        .collect()
}

/// Every member of the set carries the feature.
fn set_has_feature(set: &NodeSet, name: &str, cluster: &ClusterState) -> bool {
    cluster
        .features
        .mask(name)
        .is_some_and(|feature_mask| set.node_mask.is_subset_of(feature_mask))
}

/// Feature-count expansion plus the final pick (the oracle's required-node
/// accumulator).
///
/// For each counted feature term, a pick runs against a deep copy of the
/// node sets restricted to that feature, with the job's `(min, req,
/// min_cpus)` temporarily pinned to the count; each result joins the job's
/// required-node mask. The final pick then places the remainder. The job's
/// saved `(min_nodes, min_cpus, required mask)` are reverted on every exit
/// path.
#[allow(clippy::too_many_arguments)]
fn get_req_features<O: PlacementOracle>(
    cluster: &mut ClusterState,
    oracle: &mut O,
    reservations: &ReservationDirectory,
    jobs: &JobTable,
    job: &mut JobRecord,
    part: &PartitionRecord,
    sets: &mut [NodeSet],
    counts: NodeCounts,
    test_only: bool,
    now: i64,
    horizon: i64,
    preemption_enabled: bool,
) -> Result<PickSuccess, PickFailure> {
    let mut min_nodes = counts.min;
    let max_nodes = counts.max;
    let mut req_nodes = counts.req;

    // Nodes reserved for other jobs are off limits. A named reservation
    // already restricted the node sets, so only the implicit case overlays.
    let overlay = if job.resv_name.is_none() {
        let probe = reservations.probe_usable(job, now, horizon, cluster.node_count());
        let req_outside = job
            .details
            .req_node_mask
            .as_ref()
            .is_some_and(|req| !req.is_subset_of(&probe));
        if probe.count() < min_nodes || req_outside {
            return Err(SelectionError::NodesBusy.into()); // reserved
        }
        if probe != cluster.avail_mask {
            let mut restricted = probe;
            restricted.intersect(&cluster.avail_mask);
            AvailOverlay::install(cluster, restricted)
        } else {
            AvailOverlay::passthrough(cluster)
        }
    } else {
        AvailOverlay::passthrough(cluster)
    };

    // Save the request state that the expansion below rewrites.
    let saved_min_nodes = min_nodes;
    let saved_req_nodes = req_nodes;
    let saved_job_min_nodes = job.details.min_nodes;
    let saved_min_cpus = job.details.min_cpus;
    let mut accumulate: Option<NodeMask> = job.details.req_node_mask.take();
    let saved_req_mask: Option<NodeMask> = accumulate.clone();
    job.details.min_cpus = 1;

    let candidates = find_preemptable(jobs, job, preemption_enabled);
    let mut error: Option<PickFailure> = None;

    if !job.details.features.is_empty() && !job.details.fixed_layout {
        let counted: Vec<(String, u32)> = job
            .details
            .features
            .terms
            .iter()
            .filter(|t| t.count > 0)
            .map(|t| (t.name.clone(), t.count))
            .collect();
        // Nodes claimed by earlier counted terms; later terms must augment
        // with fresh nodes, not re-count the same ones.
        let mut picked_so_far = overlay.zero_mask();
        for (name, count) in counted {
            // The picker is destructive of the node-set list; each counted
            // feature works on a deep copy.
            let mut tmp_sets: Vec<NodeSet> = sets
                .iter()
                .filter(|s| set_has_feature(s, &name, &overlay))
                .cloned()
                .collect();
            for set in &mut tmp_sets {
                set.node_mask.subtract(&picked_so_far);
                set.nodes = set.node_mask.count();
            }
            min_nodes = count;
            req_nodes = count;
            job.details.min_nodes = count;
            job.details.min_cpus = count;
            match pick_best_nodes(
                &overlay,
                oracle,
                job,
                part,
                &mut tmp_sets,
                NodeCounts {
                    min: count,
                    max: max_nodes,
                    req: count,
                },
                test_only,
                &candidates,
            ) {
                Ok(success) => {
                    debug!(
                        job = %job.id,
                        feature = %name,
                        count,
                        picked = success.mask.count(),
                        "feature count satisfied"
                    );
                    // Each counted term picks with the required-node mask
                    // cleared; the union lands on the job only once, below.
                    picked_so_far.union(&success.mask);
                    match &mut accumulate {
                        Some(mask) => mask.union(&success.mask),
                        None => accumulate = Some(success.mask),
                    }
                }
                Err(failure) => {
                    error = Some(failure);
                    break;
                }
            }
        }
    }

    // Restore most of the job state and accumulate remaining resources.
    if let Some(saved) = &saved_req_mask {
        job.details.req_node_mask = Some(saved.clone());
    }
    if let Some(acc) = &accumulate {
        match &mut job.details.req_node_mask {
            Some(mask) => mask.union(acc),
            None => job.details.req_node_mask = Some(acc.clone()),
        }
        let node_cnt = job
            .details
            .req_node_mask
            .as_ref()
            .map(NodeMask::count)
            .unwrap_or(0);
        job.details.min_cpus = saved_min_cpus.max(node_cnt);
        min_nodes = saved_min_nodes.max(node_cnt);
        job.details.min_nodes = min_nodes;
        req_nodes = min_nodes.max(req_nodes);
        if req_nodes > max_nodes {
            error = Some(SelectionError::InfeasibleConfig.into());
        }
    } else {
        min_nodes = saved_min_nodes;
        req_nodes = saved_req_nodes;
        job.details.min_cpus = saved_min_cpus;
        job.details.min_nodes = saved_job_min_nodes;
    }

    let result = match error {
        Some(failure) => Err(failure),
        None => pick_best_nodes(
            &overlay,
            oracle,
            job,
            part,
            sets,
            NodeCounts {
                min: min_nodes,
                max: max_nodes,
                req: req_nodes,
            },
            test_only,
            &candidates,
        ),
    };

    // Restoration is unconditional: the job's request fields leave exactly
    // as they entered, success or not.
    job.details.req_node_mask = saved_req_mask;
    job.details.min_cpus = saved_min_cpus;
    job.details.min_nodes = saved_job_min_nodes;

    drop(overlay); // avail population restored here on every path
    result
}
