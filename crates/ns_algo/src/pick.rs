//! Best-node picking.
//!
//! The accumulate-and-probe loop: walk the weight-ordered node sets one
//! exclusive alternative at a time, union members into a growing candidate
//! mask restricted to currently usable nodes, and hand the mask to the
//! placement oracle once it could plausibly satisfy the request. Probing
//! is destructive, so every oracle call works on a disposable copy.
//!
//! A failed pick must end in exactly one of three diagnoses:
//!
//! - `NodesBusy`: a `TEST_ONLY` probe over the *currently available*
//!   candidates fits, so retry next cycle (the near-miss mask rides along);
//! - `PartConfigUnavailable`: only a probe over *every configured*
//!   candidate fits, so nodes must come back up first;
//! - `InfeasibleConfig`: not even that; the request can never run here.

use tracing::{debug, info};

use ns_core::{
    ClusterState, JobId, JobLayout, JobRecord, NodeMask, PartitionRecord, SelectionError,
    ShareMode,
};

use crate::node_sets::NodeSet;
use crate::oracle::{PlacementOracle, PlacementVerdict, PreempteeCandidate, SelectMode};
use crate::share::resolve_share;

/// Resolved node-count bounds for one selection call.
#[derive(Clone, Copy, Debug)]
pub struct NodeCounts {
    pub min: u32,
    pub max: u32,
    pub req: u32,
}

#[derive(Clone, Debug)]
pub struct PickSuccess {
    pub mask: NodeMask,
    pub cpu_count: u32,
    pub layout: JobLayout,
    pub preemptees: Vec<JobId>,
    pub share: ShareMode,
}

/// Failure kind plus, when known, the closest candidate mask (informational
/// for "waiting on" style reporting).
#[derive(Clone, Debug)]
pub struct PickFailure {
    pub error: SelectionError,
    pub possible: Option<NodeMask>,
}

impl From<SelectionError> for PickFailure {
    fn from(error: SelectionError) -> Self {
        Self {
            error,
            possible: None,
        }
    }
}

/// Select the best nodes for a job from weight-ordered `sets`.
///
/// Destructive of `sets`: member masks are narrowed to the usable
/// population as accumulation proceeds. Callers that need the list again
/// pass a deep copy. On success the resolved sharing mode is also written
/// back to `job.resolved_share`.
#[allow(clippy::too_many_arguments)]
pub fn pick_best_nodes<O: PlacementOracle>(
    cluster: &ClusterState,
    oracle: &mut O,
    job: &mut JobRecord,
    part: &PartitionRecord,
    sets: &mut [NodeSet],
    counts: NodeCounts,
    test_only: bool,
    preemptee_candidates: &[PreempteeCandidate],
) -> Result<PickSuccess, PickFailure> {
    let select_mode = if test_only {
        SelectMode::TestOnly
    } else {
        SelectMode::RunNow
    };

    if sets.is_empty() {
        info!(job = %job.id, "empty node set for selection");
        return Err(SelectionError::InfeasibleConfig.into());
    }

    let share = resolve_share(
        job.details.share_request,
        part.max_share,
        oracle.consumable_resources(),
    );
    job.resolved_share = share;
    let shared = share.is_shared();
    // With preemption on, busy nodes stay in play: their owners become
    // preemptee candidates instead of blocking the request.
    let preempt = cluster.preemption_enabled;

    if let Some(req_mask) = &job.details.req_node_mask {
        if !req_mask.is_subset_of(&cluster.avail_mask) {
            return Err(SelectionError::NodeNotAvail.into());
        }
        if counts.min != 0 && req_mask.count() > counts.max {
            return Err(SelectionError::InfeasibleConfig.into());
        }
        if !preempt {
            if shared {
                if !req_mask.is_subset_of(&cluster.share_mask) {
                    return Err(SelectionError::NodesBusy.into());
                }
                if req_mask.overlaps(&cluster.completing_mask) {
                    return Err(SelectionError::NodesBusy.into());
                }
            } else if !req_mask.is_subset_of(&cluster.idle_mask) {
                // IDLE nodes are never COMPLETING.
                return Err(SelectionError::NodesBusy.into());
            }
        } else if req_mask.overlaps(&cluster.completing_mask) {
            return Err(SelectionError::NodesBusy.into());
        }
    }

    // Range of exclusive-alternative positions present across the sets.
    let mut min_feature = usize::MAX;
    let mut max_feature = 0usize;
    let mut any_feature = false;
    for set in sets.iter() {
        if let Some(first) = set.feature_bits.first_set() {
            any_feature = true;
            min_feature = min_feature.min(first);
        }
        if let Some(last) = set.feature_bits.last_set() {
            max_feature = max_feature.max(last);
        }
    }

    debug!(
        job = %job.id,
        idle = cluster.idle_mask.count(),
        sharable = cluster.share_mask.count(),
        "picking best nodes"
    );

    let mut runable_ever = false;
    let mut runable_avail = false;
    let mut possible: Option<NodeMask> = None;

    if any_feature {
        'alternatives: for alt in min_feature..=max_feature {
            let mut avail_accum: Option<NodeMask> = None;
            let mut total_accum: Option<NodeMask> = None;
            let mut avail_nodes = 0u32;
            let mut tried_sched = false;

            if let Some(req_mask) = &job.details.req_node_mask {
                let mut reachable = cluster.zero_mask();
                for set in sets.iter() {
                    if set.feature_bits.test(alt) {
                        reachable.union(&set.node_mask);
                    }
                }
                if !req_mask.is_subset_of(&reachable) {
                    continue 'alternatives;
                }
                avail_accum = Some(req_mask.clone());
            }

            let set_count = sets.len();
            for i in 0..set_count {
                if !sets[i].feature_bits.test(alt) {
                    continue;
                }

                match &mut total_accum {
                    Some(total) => total.union(&sets[i].node_mask),
                    None => total_accum = Some(sets[i].node_mask.clone()),
                }

                // Narrow the set to nodes usable right now.
                sets[i].node_mask.intersect(&cluster.avail_mask);
                if !preempt {
                    if shared {
                        sets[i].node_mask.intersect(&cluster.share_mask);
                        sets[i].node_mask.subtract(&cluster.completing_mask);
                    } else {
                        sets[i].node_mask.intersect(&cluster.idle_mask);
                    }
                } else {
                    sets[i].node_mask.subtract(&cluster.completing_mask);
                }

                match &mut avail_accum {
                    Some(avail) => avail.union(&sets[i].node_mask),
                    None => avail_accum = Some(sets[i].node_mask.clone()),
                }
                avail_nodes = avail_accum.as_ref().map(NodeMask::count).unwrap_or(0);
                tried_sched = false;

                // Anti-thrash: within one weight tier, keep accumulating so
                // the oracle sees the whole tier and picks the most lightly
                // loaded members.
                if (shared || preempt)
                    && i + 1 < set_count
                    && sets[i].weight == sets[i + 1].weight
                {
                    continue;
                }

                if avail_nodes < counts.min
                    || (avail_nodes < counts.req && i + 1 < set_count)
                {
                    continue; // keep accumulating
                }

                let backup = avail_accum.clone().unwrap();
                let candidates = avail_accum.take().unwrap();
                match oracle.job_test(
                    cluster,
                    job,
                    candidates,
                    counts.min,
                    counts.max,
                    counts.req,
                    select_mode,
                    preemptee_candidates,
                ) {
                    PlacementVerdict::Fit(placement) => {
                        if placement.selection.count() > counts.max {
                            // Over-selection is an oracle bug; abandon the
                            // whole alternative rather than trim.
                            avail_accum = Some(placement.selection);
                            avail_nodes = 0;
                            break;
                        }
                        return Ok(PickSuccess {
                            mask: placement.selection,
                            cpu_count: placement.cpu_count,
                            layout: placement.layout,
                            preemptees: placement.preemptees,
                            share,
                        });
                    }
                    PlacementVerdict::NoFit => {
                        tried_sched = true;
                        avail_accum = Some(backup);
                    }
                }
            }

            // Everything accumulated but never probed at the desired count:
            // one more try at what we have.
            if let Some(avail) = &avail_accum {
                let req_ok = job
                    .details
                    .req_node_mask
                    .as_ref()
                    .map_or(true, |req| req.is_subset_of(avail));
                if !tried_sched && avail_nodes >= counts.min && req_ok {
                    let backup = avail.clone();
                    let candidates = avail_accum.take().unwrap();
                    match oracle.job_test(
                        cluster,
                        job,
                        candidates,
                        counts.min,
                        counts.max,
                        counts.req,
                        select_mode,
                        preemptee_candidates,
                    ) {
                        PlacementVerdict::Fit(placement)
                            if placement.selection.count() <= counts.max =>
                        {
                            return Ok(PickSuccess {
                                mask: placement.selection,
                                cpu_count: placement.cpu_count,
                                layout: placement.layout,
                                preemptees: placement.preemptees,
                                share,
                            });
                        }
                        _ => avail_accum = Some(backup),
                    }
                }
            }

            // No pick for this alternative: classify what is still possible.
            if let Some(total) = &total_accum {
                let total_nodes = total.count();
                let req_ok = job
                    .details
                    .req_node_mask
                    .as_ref()
                    .map_or(true, |req| req.is_subset_of(total));
                if (!runable_ever || !runable_avail) && total_nodes >= counts.min && req_ok {
                    if !runable_avail {
                        let mut now_usable = total.clone();
                        now_usable.intersect(&cluster.avail_mask);
                        if let PlacementVerdict::Fit(placement) = oracle.job_test(
                            cluster,
                            job,
                            now_usable,
                            counts.min,
                            counts.max,
                            counts.req,
                            SelectMode::TestOnly,
                            preemptee_candidates,
                        ) {
                            runable_ever = true;
                            if placement.selection.count() <= counts.max {
                                runable_avail = true;
                            }
                            possible = Some(placement.selection);
                        }
                    }
                    if !runable_ever {
                        if let PlacementVerdict::Fit(placement) = oracle.job_test(
                            cluster,
                            job,
                            total.clone(),
                            counts.min,
                            counts.max,
                            counts.req,
                            SelectMode::TestOnly,
                            preemptee_candidates,
                        ) {
                            runable_ever = true;
                            possible = Some(placement.selection);
                        }
                    }
                }
            }
        }
    }

    if runable_avail {
        // Can run on available nodes, just not right now.
        return Err(PickFailure {
            error: SelectionError::NodesBusy,
            possible,
        });
    }
    if runable_ever {
        return Err(PickFailure {
            error: SelectionError::PartConfigUnavailable,
            possible,
        });
    }
    info!(job = %job.id, "job never runnable on this configuration");
    Err(SelectionError::InfeasibleConfig.into())
}
