//! End-to-end selection scenarios driven through the controller.

use ns_algo::LinearOracle;
use ns_core::{
    CkptSupport, ClusterState, ConfigId, ConfigRecord, FeatureRegistry, JobId, JobRecord,
    JobState, NodeFlags, NodeId, NodeMask, NodeRecord, NodeState, PartitionId, PartitionRecord,
    PreemptMode, SelectionError, SharePolicy, ShareRequest, StateReason,
};
use ns_pipeline::{AgentMessage, Controller, Reservation};

const NOW: i64 = 1_700_000_000;

/// Build a cluster from (node_count, cpus, weight, features) config specs.
fn cluster_of(specs: &[(usize, u32, u32, &[&str])]) -> ClusterState {
    let mut cluster = ClusterState::default();
    let total: usize = specs.iter().map(|s| s.0).sum();
    let mut next = 0usize;
    for (ci, (count, cpus, weight, feats)) in specs.iter().enumerate() {
        let mut members = NodeMask::new(total);
        for _ in 0..*count {
            members.set(next);
            cluster.nodes.push(NodeRecord {
                id: NodeId::new(next as u32),
                name: format!("n{next}"),
                addr: format!("10.0.0.{next}"),
                config: ConfigId::new(ci as u32),
                state: NodeState::Idle,
                flags: NodeFlags::default(),
                cpus: *cpus,
                sockets: 1,
                cores: 1,
                threads: 1,
                real_memory: 4096,
                tmp_disk: 0,
                run_jobs: 0,
                comp_jobs: 0,
                no_share_jobs: 0,
            });
            next += 1;
        }
        cluster.configs.push(ConfigRecord {
            id: ConfigId::new(ci as u32),
            name: format!("cfg{ci}"),
            cpus: *cpus,
            sockets: 1,
            cores: 1,
            threads: 1,
            real_memory: 4096,
            tmp_disk: 0,
            weight: *weight,
            feature_names: feats.iter().map(|s| s.to_string()).collect(),
            node_mask: members,
        });
    }
    let mut registry = FeatureRegistry::default();
    let mut by_name: std::collections::BTreeMap<String, NodeMask> = Default::default();
    for config in &cluster.configs {
        for f in &config.feature_names {
            by_name
                .entry(f.clone())
                .or_insert_with(|| NodeMask::new(total))
                .union(&config.node_mask);
        }
    }
    for (name, mask) in by_name {
        registry.insert(name, mask);
    }
    cluster.features = registry;
    cluster.partitions.push(PartitionRecord {
        id: PartitionId::new(0),
        name: "batch".into(),
        node_mask: NodeMask::filled(total),
        ..PartitionRecord::default()
    });
    cluster.fast_schedule = true;
    cluster.rebuild_masks();
    cluster
}

fn controller(cluster: ClusterState) -> Controller<LinearOracle> {
    Controller::new(cluster, LinearOracle)
}

fn pending_job(id: u32, min_nodes: u32) -> JobRecord {
    let mut job = JobRecord::new(JobId::new(id), PartitionId::new(0));
    job.user = "alice".into();
    job.details.min_nodes = min_nodes;
    job.details.min_cpus = min_nodes;
    job
}

#[test]
fn xor_allocation_never_mixes_alternatives() {
    // Nodes {0,1} carry fs1, {2,3} carry fs2; the job takes either pair,
    // never a mix.
    let mut ctl = controller(cluster_of(&[(2, 4, 1, &["fs1"]), (2, 4, 1, &["fs2"])]));
    let mut job = pending_job(1, 2);
    job.details.features = "[fs1|fs2]".parse().unwrap();
    ctl.jobs.insert(job);

    let success = ctl.select_nodes(JobId::new(1), false, NOW).expect("select");
    let chosen: Vec<usize> = success.nodes.ones().collect();
    assert!(
        chosen == vec![0, 1] || chosen == vec![2, 3],
        "mixed alternatives: {chosen:?}"
    );
    assert_eq!(ctl.jobs.get(JobId::new(1)).unwrap().state, JobState::Running);
}

#[test]
fn feature_counts_accumulate_then_augment() {
    // 8 nodes: 4 gpu, 4 plain-default. `4*gpu&2*default` first pins the
    // four gpu nodes, then two default nodes join the required set.
    let mut ctl = controller(cluster_of(&[
        (4, 4, 1, &["gpu", "default"]),
        (4, 4, 1, &["default"]),
    ]));
    let mut job = pending_job(1, 1);
    job.details.features = "4*gpu&2*default".parse().unwrap();
    ctl.jobs.insert(job);

    let success = ctl.select_nodes(JobId::new(1), false, NOW).expect("select");
    assert_eq!(success.nodes.count(), 6);
    let gpu_nodes: Vec<usize> = success.nodes.ones().filter(|&i| i < 4).collect();
    assert_eq!(gpu_nodes.len(), 4, "all four gpu nodes belong to the pick");
    assert!(success.cpu_count >= 6);

    // Request state reverted even on success.
    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    assert_eq!(job.details.min_nodes, 1);
    assert_eq!(job.details.min_cpus, 1);
    assert!(job.details.req_node_mask.is_none());
}

#[test]
fn required_down_node_is_permanent_and_floors_priority() {
    let mut ctl = controller(cluster_of(&[(3, 4, 1, &[])]));
    ctl.cluster.nodes[1].state = NodeState::Down;
    ctl.cluster.rebuild_masks();

    let mut job = pending_job(7, 1);
    job.priority = 500;
    let mut req = ctl.cluster.zero_mask();
    req.set(1);
    job.details.req_node_mask = Some(req.clone());
    let saved_details = (job.details.min_nodes, job.details.min_cpus);
    ctl.jobs.insert(job);

    let err = ctl.select_nodes(JobId::new(7), false, NOW).unwrap_err();
    assert_eq!(err, SelectionError::NodeNotAvail);

    let job = ctl.jobs.get(JobId::new(7)).unwrap();
    assert_eq!(job.state_reason, StateReason::NodesRequiredDown);
    assert_eq!(job.priority, 1, "permanent failure floors priority");
    assert_eq!(
        (job.details.min_nodes, job.details.min_cpus),
        saved_details
    );
    assert_eq!(job.details.req_node_mask.as_ref(), Some(&req));
    assert!(job.is_pending());
}

#[test]
fn forced_share_partition_overrides_exclusive_request() {
    let mut ctl = controller(cluster_of(&[(2, 4, 1, &[])]));
    ctl.cluster.partitions[0].max_share = SharePolicy::Force(4);

    let mut job = pending_job(1, 1);
    job.details.share_request = ShareRequest::Exclusive;
    ctl.jobs.insert(job);

    ctl.select_nodes(JobId::new(1), false, NOW).expect("select");
    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    assert_eq!(job.resolved_share, ns_core::ShareMode::ForcedShare);
    // Shared allocation leaves the node in the sharable population.
    let allocated = job.node_mask.as_ref().unwrap().first_set().unwrap();
    assert!(ctl.cluster.share_mask.test(allocated));
}

#[test]
fn imminent_foreign_reservation_is_transient_busy() {
    let mut ctl = controller(cluster_of(&[(4, 4, 1, &[])]));
    ctl.reservations.insert(Reservation {
        name: "ops-window".into(),
        node_mask: ctl.cluster.full_mask(),
        start_time: NOW + 30,
        end_time: NOW + 3_600,
        users: vec!["ops".into()],
    });

    let mut job = pending_job(1, 2);
    job.priority = 900;
    ctl.jobs.insert(job);

    let err = ctl.select_nodes(JobId::new(1), false, NOW).unwrap_err();
    assert_eq!(err, SelectionError::NodesBusy);
    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    assert!(job.is_pending());
    assert_eq!(job.priority, 900, "transient failure keeps priority");
    // The temporary avail overlay was restored.
    assert_eq!(ctl.cluster.avail_mask.count(), 4);
}

/// Preemption helper: one low-priority victim running on both nodes of a
/// two-node cluster, one high-priority job wanting them.
fn preemption_fixture(
    mode: PreemptMode,
    ckpt: CkptSupport,
    requeue_allowed: bool,
) -> Controller<LinearOracle> {
    let mut ctl = controller(cluster_of(&[(2, 4, 1, &[])]));
    ctl.cluster.preemption_enabled = true;

    let mut victim = pending_job(10, 2);
    victim.priority = 10;
    victim.preempt_mode = mode;
    victim.ckpt = ckpt;
    victim.requeue_allowed = requeue_allowed;
    ctl.jobs.insert(victim);
    ctl.select_nodes(JobId::new(10), false, NOW - 100)
        .expect("victim starts");

    let mut contender = pending_job(20, 2);
    contender.priority = 1_000;
    ctl.jobs.insert(contender);
    ctl
}

#[test]
fn preempt_checkpoint_requeues_and_surfaces_busy() {
    let mut ctl = preemption_fixture(PreemptMode::Checkpoint, CkptSupport::Requeue, true);

    let err = ctl.select_nodes(JobId::new(20), false, NOW).unwrap_err();
    assert_eq!(err, SelectionError::NodesBusy, "caller retries next cycle");

    let victim = ctl.jobs.get(JobId::new(10)).unwrap();
    assert_eq!(victim.state, JobState::Pending, "checkpoint-requeued");
    let kill: Vec<_> = ctl.agent.iter().collect();
    assert_eq!(kill.len(), 1);
    assert_eq!(kill[0].message, AgentMessage::KillPreempted);
    assert_eq!(kill[0].job, JobId::new(10));
}

#[test]
fn preempt_checkpoint_falls_back_to_vacate_then_kill() {
    // Vacate-only: the requeue attempt is unsupported, the vacate lands.
    let mut ctl = preemption_fixture(PreemptMode::Checkpoint, CkptSupport::VacateOnly, true);
    ctl.select_nodes(JobId::new(20), false, NOW).unwrap_err();
    assert_eq!(
        ctl.jobs.get(JobId::new(10)).unwrap().state,
        JobState::Cancelled
    );

    // No checkpoint support at all: the hard kill backstop fires.
    let mut ctl = preemption_fixture(PreemptMode::Checkpoint, CkptSupport::Unsupported, true);
    ctl.select_nodes(JobId::new(20), false, NOW).unwrap_err();
    assert_eq!(
        ctl.jobs.get(JobId::new(10)).unwrap().state,
        JobState::Cancelled
    );
    assert_eq!(ctl.agent.len(), 1);
}

#[test]
fn preempted_nodes_free_up_for_the_next_cycle() {
    let mut ctl = preemption_fixture(PreemptMode::Requeue, CkptSupport::Unsupported, true);
    ctl.select_nodes(JobId::new(20), false, NOW).unwrap_err();

    // The victims' nodes finish completing before the next cycle.
    let victim_mask = ctl
        .jobs
        .get(JobId::new(10))
        .unwrap()
        .completing_mask
        .clone()
        .unwrap();
    for i in victim_mask.ones() {
        ctl.cluster.make_node_idle(NodeId::new(i as u32), true);
    }
    ctl.jobs.get_mut(JobId::new(10)).unwrap().node_mask = None;

    let success = ctl.select_nodes(JobId::new(20), false, NOW + 60).expect("retry");
    assert_eq!(success.nodes.count(), 2);
}

#[test]
fn gang_suspension_lets_the_job_start() {
    let mut ctl = preemption_fixture(PreemptMode::Suspend, CkptSupport::Unsupported, true);
    ctl.cluster.gang_scheduling = true;

    // Suspension is the gang scheduler's job: nothing is actioned here and
    // the selection commits over the victim's nodes.
    let success = ctl.select_nodes(JobId::new(20), false, NOW).expect("select");
    assert!(!success.preempted.is_empty());
    assert_eq!(
        ctl.jobs.get(JobId::new(20)).unwrap().state,
        JobState::Running
    );
    assert!(ctl.agent.is_empty());
}

#[test]
fn commit_claims_nodes_out_of_idle() {
    let mut ctl = controller(cluster_of(&[(4, 4, 1, &[])]));
    ctl.jobs.insert(pending_job(1, 2));

    let success = ctl.select_nodes(JobId::new(1), false, NOW).expect("select");
    for i in success.nodes.ones() {
        assert_eq!(ctl.cluster.nodes[i].state, NodeState::Allocated);
        assert!(!ctl.cluster.idle_mask.test(i), "no double-commit");
    }
    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    assert_eq!(job.node_cnt, 2);
    assert_eq!(job.batch_host.as_deref(), Some("n0"));
    assert_eq!(job.node_addrs.len(), 2);
    assert_eq!(job.end_time, NOW + 365 * 24 * 60 * 60); // partition INFINITE default
}

#[test]
fn powered_down_nodes_are_last_resort_and_mark_configuring() {
    let mut ctl = controller(cluster_of(&[(4, 4, 1, &[])]));
    ctl.cluster.nodes[0].flags.power_save = true;
    ctl.cluster.nodes[1].flags.power_save = true;
    ctl.cluster.rebuild_masks();

    // Two powered-up nodes suffice: the job avoids the penalized tier.
    ctl.jobs.insert(pending_job(1, 2));
    let success = ctl.select_nodes(JobId::new(1), false, NOW).expect("select");
    assert_eq!(success.nodes.ones().collect::<Vec<_>>(), vec![2, 3]);
    assert!(!ctl.jobs.get(JobId::new(1)).unwrap().configuring);

    // The next job must boot the powered-down pair and waits on it.
    ctl.jobs.insert(pending_job(2, 2));
    let success = ctl.select_nodes(JobId::new(2), false, NOW).expect("select");
    assert_eq!(success.nodes.ones().collect::<Vec<_>>(), vec![0, 1]);
    assert!(ctl.jobs.get(JobId::new(2)).unwrap().configuring);
}

#[test]
fn test_only_probes_without_touching_state() {
    let mut ctl = controller(cluster_of(&[(4, 4, 1, &[])]));
    ctl.jobs.insert(pending_job(1, 2));

    let success = ctl.select_nodes(JobId::new(1), true, NOW).expect("probe");
    assert!(success.test_only);
    assert_eq!(success.nodes.count(), 2);

    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    assert!(job.is_pending());
    assert!(job.node_mask.is_none());
    assert_eq!(ctl.cluster.idle_mask.count(), 4, "populations untouched");
}

#[test]
fn held_job_keeps_priority_zero() {
    let mut ctl = controller(cluster_of(&[(2, 4, 1, &[])]));
    let mut job = pending_job(1, 1);
    job.priority = 0;
    ctl.jobs.insert(job);

    let err = ctl.select_nodes(JobId::new(1), false, NOW).unwrap_err();
    assert_eq!(err, SelectionError::JobHeld);
    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    assert_eq!(job.priority, 0);
    assert_eq!(job.state_reason, StateReason::Held);
}

#[test]
fn down_partition_is_transient() {
    let mut ctl = controller(cluster_of(&[(2, 4, 1, &[])]));
    ctl.cluster.partitions[0].state = ns_core::PartitionState::Down;
    let mut job = pending_job(1, 1);
    job.priority = 300;
    ctl.jobs.insert(job);

    let err = ctl.select_nodes(JobId::new(1), false, NOW).unwrap_err();
    assert_eq!(err, SelectionError::PartitionDown);
    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    assert_eq!(job.state_reason, StateReason::PartitionDown);
    assert_eq!(job.priority, 300);
}

#[test]
fn partition_node_limit_is_permanent() {
    let mut ctl = controller(cluster_of(&[(4, 4, 1, &[])]));
    ctl.cluster.partitions[0].max_nodes = 2;
    let mut job = pending_job(1, 3);
    job.priority = 300;
    ctl.jobs.insert(job);

    let err = ctl.select_nodes(JobId::new(1), false, NOW).unwrap_err();
    assert_eq!(err, SelectionError::PartNodeLimit);
    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    assert_eq!(job.state_reason, StateReason::PartitionNodeLimit);
    assert_eq!(job.priority, 1);
}

#[test]
fn named_reservation_restricts_and_rejects() {
    let mut ctl = controller(cluster_of(&[(4, 4, 1, &[])]));
    let mut resv_nodes = ctl.cluster.zero_mask();
    resv_nodes.set(2);
    resv_nodes.set(3);
    ctl.reservations.insert(Reservation {
        name: "win".into(),
        node_mask: resv_nodes,
        start_time: NOW - 10,
        end_time: NOW + 3_600,
        users: vec!["alice".into()],
    });

    let mut job = pending_job(1, 2);
    job.resv_name = Some("win".into());
    ctl.jobs.insert(job);
    let success = ctl.select_nodes(JobId::new(1), false, NOW).expect("select");
    assert_eq!(success.nodes.ones().collect::<Vec<_>>(), vec![2, 3]);

    // Required node outside the reservation: permanent.
    let mut job = pending_job(2, 1);
    job.resv_name = Some("win".into());
    let mut req = ctl.cluster.zero_mask();
    req.set(0);
    job.details.req_node_mask = Some(req);
    ctl.jobs.insert(job);
    let err = ctl.select_nodes(JobId::new(2), false, NOW).unwrap_err();
    assert_eq!(err, SelectionError::InfeasibleConfig);
    assert_eq!(
        ctl.jobs.get(JobId::new(2)).unwrap().state_reason,
        StateReason::Reservation
    );

    // Lapsed reservation: permanent, distinct kind.
    let mut job = pending_job(3, 1);
    job.resv_name = Some("win".into());
    ctl.jobs.insert(job);
    let err = ctl
        .select_nodes(JobId::new(3), false, NOW + 7_200)
        .unwrap_err();
    assert_eq!(err, SelectionError::ReservationNotUsable);
}

#[test]
fn deallocate_moves_nodes_to_completing_and_enqueues_kill() {
    let mut ctl = controller(cluster_of(&[(2, 4, 1, &[])]));
    ctl.jobs.insert(pending_job(1, 2));
    ctl.select_nodes(JobId::new(1), false, NOW).expect("select");

    ctl.deallocate_nodes(JobId::new(1), false, false, false, NOW + 500);
    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    assert!(job.completing);
    assert_eq!(job.completing_mask.as_ref().unwrap().count(), 2);
    for i in 0..2 {
        assert!(ctl.cluster.completing_mask.test(i));
        assert!(!ctl.cluster.idle_mask.test(i), "completing is never idle");
    }
    let requests = ctl.agent.drain();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].message, AgentMessage::TerminateJob);
    assert_eq!(requests[0].hosts, vec!["n0".to_string(), "n1".to_string()]);
}

#[test]
fn deallocate_all_down_nodes_skips_the_agent() {
    let mut ctl = controller(cluster_of(&[(2, 4, 1, &[])]));
    ctl.jobs.insert(pending_job(1, 2));
    ctl.select_nodes(JobId::new(1), false, NOW).expect("select");

    ctl.cluster.nodes[0].state = NodeState::Down;
    ctl.cluster.nodes[1].state = NodeState::Down;

    ctl.deallocate_nodes(JobId::new(1), false, false, false, NOW + 500);
    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    assert!(!job.completing, "job leaves COMPLETING at once");
    assert_eq!(job.completing_mask.as_ref().unwrap().count(), 0);
    assert!(ctl.agent.is_empty(), "no request for dead nodes");
}

#[test]
fn timeout_deallocation_uses_the_timelimit_message() {
    let mut ctl = controller(cluster_of(&[(1, 4, 1, &[])]));
    ctl.jobs.insert(pending_job(1, 1));
    ctl.select_nodes(JobId::new(1), false, NOW).expect("select");

    ctl.deallocate_nodes(JobId::new(1), true, false, false, NOW + 500);
    let requests = ctl.agent.drain();
    assert_eq!(requests[0].message, AgentMessage::KillTimelimit);
}

#[test]
fn re_kill_skips_down_and_unresponsive_nodes() {
    let mut ctl = controller(cluster_of(&[(3, 4, 1, &[])]));
    ctl.jobs.insert(pending_job(1, 3));
    ctl.select_nodes(JobId::new(1), false, NOW).expect("select");
    ctl.deallocate_nodes(JobId::new(1), false, false, false, NOW + 10);
    ctl.agent.drain();

    // One node died, one stopped answering; only n2 gets the resend.
    ctl.cluster.nodes[0].state = NodeState::Down;
    ctl.cluster.nodes[1].flags.no_respond = true;

    ctl.re_kill_job(JobId::new(1), NOW + 120);
    let requests = ctl.agent.drain();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].hosts, vec!["n2".to_string()]);

    let job = ctl.jobs.get(JobId::new(1)).unwrap();
    let still_completing: Vec<usize> =
        job.completing_mask.as_ref().unwrap().ones().collect();
    assert_eq!(still_completing, vec![1, 2], "down node considered done");
}

#[test]
fn selection_is_a_superset_of_required_and_stays_in_sets() {
    let mut ctl = controller(cluster_of(&[(4, 4, 1, &["fast"]), (4, 4, 2, &["slow"])]));
    let mut job = pending_job(1, 3);
    let mut req = ctl.cluster.zero_mask();
    req.set(5); // a heavier slow node
    job.details.req_node_mask = Some(req.clone());
    ctl.jobs.insert(job);

    let success = ctl.select_nodes(JobId::new(1), false, NOW).expect("select");
    assert!(req.is_subset_of(&success.nodes));
    assert!(success.nodes.count() >= 3);
}

#[test]
fn accounting_gate_short_circuits() {
    let mut ctl = controller(cluster_of(&[(2, 4, 1, &[])]));
    let mut job = pending_job(1, 1);
    job.acct_policy_ok = false;
    ctl.jobs.insert(job);
    assert_eq!(
        ctl.select_nodes(JobId::new(1), false, NOW).unwrap_err(),
        SelectionError::AccountingPolicy
    );
}

#[test]
fn queue_order_sees_prior_allocations() {
    // Two jobs, two nodes each, four nodes total: the second selection
    // must observe the first commit and come up busy.
    let mut ctl = controller(cluster_of(&[(3, 4, 1, &[])]));
    ctl.jobs.insert(pending_job(1, 2));
    ctl.jobs.insert(pending_job(2, 2));

    ctl.select_nodes(JobId::new(1), false, NOW).expect("first");
    let err = ctl.select_nodes(JobId::new(2), false, NOW).unwrap_err();
    assert_eq!(err, SelectionError::NodesBusy);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any failing selection leaves the job's request fields exactly
        /// as they entered.
        #[test]
        fn failure_restores_request_state(
            min_nodes in 1u32..12,
            counted in 0u32..5,
            busy in any::<bool>(),
        ) {
            let mut ctl = controller(cluster_of(&[
                (2, 4, 1, &["gpu"]),
                (2, 4, 2, &[]),
            ]));
            if busy {
                // Claim every node so only transient failures remain.
                for i in 0..4 {
                    ctl.cluster.make_node_alloc(NodeId::new(i), true);
                }
            }
            let mut job = pending_job(1, min_nodes);
            if counted > 0 {
                job.details.features =
                    format!("{counted}*gpu").parse().unwrap();
            }
            let mut req = ctl.cluster.zero_mask();
            req.set(0);
            job.details.req_node_mask = Some(req.clone());
            let saved = (
                job.details.min_nodes,
                job.details.min_cpus,
                job.details.req_node_mask.clone(),
            );
            ctl.jobs.insert(job);

            if let Err(_) = ctl.select_nodes(JobId::new(1), false, NOW) {
                let job = ctl.jobs.get(JobId::new(1)).unwrap();
                prop_assert_eq!(job.details.min_nodes, saved.0);
                prop_assert_eq!(job.details.min_cpus, saved.1);
                prop_assert_eq!(job.details.req_node_mask.clone(), saved.2);
                prop_assert!(job.is_pending());
            }
        }
    }
}
