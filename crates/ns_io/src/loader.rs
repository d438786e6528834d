//! Snapshot loader: names → registry indices → `ClusterState` + job queue.
//!
//! All cross-references are checked here, so the engine never sees a
//! dangling name. Jobs carrying `running_on` are replayed into the node
//! populations at load time.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ns_core::{
    ClusterState, ConfigId, ConfigRecord, FeatureRegistry, JobDetails, JobId, JobRecord, JobState,
    License, MemoryRequirement, MultiCoreSpec, NodeFlags, NodeId, NodeMask, NodeRecord, NodeState,
    PartitionId, PartitionRecord, PartitionState, PreemptMode, SharePolicy, ShareRequest,
    CkptSupport, INFINITE,
};

use crate::hasher::digest_canonical;
use crate::snapshot::{
    CkptSpec, NodeStateSpec, PartitionStateSpec, PreemptModeSpec, ShareRequestSpec, ShareSpec,
    Snapshot,
};
use crate::IoError;

/// A reservation with its node names resolved to a mask. The pipeline's
/// reservation directory is built from these.
#[derive(Clone, Debug)]
pub struct LoadedReservation {
    pub name: String,
    pub node_mask: NodeMask,
    pub start_time: i64,
    pub end_time: i64,
    pub users: Vec<String>,
}

/// Everything the controller needs from one snapshot file.
#[derive(Debug)]
pub struct LoadedSnapshot {
    pub now: i64,
    pub cluster: ClusterState,
    pub jobs: Vec<JobRecord>,
    pub reservations: Vec<LoadedReservation>,
    /// Canonical digest of the snapshot, echoed into decision reports.
    pub digest: String,
}

pub fn load_path(path: &Path) -> Result<LoadedSnapshot, IoError> {
    let bytes = fs::read(path)?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    build(&snapshot)
}

pub fn build(snapshot: &Snapshot) -> Result<LoadedSnapshot, IoError> {
    let digest = digest_canonical(snapshot)?;
    let node_count = snapshot.nodes.len();

    // Configurations first: nodes point at them by name.
    let mut config_ids: BTreeMap<&str, ConfigId> = BTreeMap::new();
    let mut configs: Vec<ConfigRecord> = Vec::with_capacity(snapshot.configs.len());
    for (i, spec) in snapshot.configs.iter().enumerate() {
        let id = ConfigId::new(i as u32);
        if config_ids.insert(&spec.name, id).is_some() {
            return Err(IoError::DuplicateName {
                kind: "configuration",
                name: spec.name.clone(),
            });
        }
        configs.push(ConfigRecord {
            id,
            name: spec.name.clone(),
            cpus: spec.cpus,
            sockets: spec.sockets,
            cores: spec.cores,
            threads: spec.threads,
            real_memory: spec.real_memory,
            tmp_disk: spec.tmp_disk,
            weight: spec.weight,
            feature_names: spec.features.clone(),
            node_mask: NodeMask::new(node_count),
        });
    }

    let mut node_ids: BTreeMap<&str, NodeId> = BTreeMap::new();
    let mut nodes: Vec<NodeRecord> = Vec::with_capacity(node_count);
    for (i, spec) in snapshot.nodes.iter().enumerate() {
        let id = NodeId::new(i as u32);
        if node_ids.insert(&spec.name, id).is_some() {
            return Err(IoError::DuplicateName {
                kind: "node",
                name: spec.name.clone(),
            });
        }
        let config_id = *config_ids
            .get(spec.config.as_str())
            .ok_or_else(|| IoError::UnknownConfig {
                node: spec.name.clone(),
                config: spec.config.clone(),
            })?;
        let config = &mut configs[config_id.index()];
        config.node_mask.set(i);
        nodes.push(NodeRecord {
            id,
            name: spec.name.clone(),
            addr: spec.addr.clone(),
            config: config_id,
            state: match spec.state {
                NodeStateSpec::Idle => NodeState::Idle,
                NodeStateSpec::Allocated => NodeState::Allocated,
                NodeStateSpec::Mixed => NodeState::Mixed,
                NodeStateSpec::Down => NodeState::Down,
            },
            flags: NodeFlags {
                completing: false,
                drain: spec.drain,
                fail: false,
                power_save: spec.power_save,
                no_respond: spec.no_respond,
            },
            cpus: spec.cpus.unwrap_or(config.cpus),
            sockets: config.sockets,
            cores: config.cores,
            threads: config.threads,
            real_memory: spec.real_memory.unwrap_or(config.real_memory),
            tmp_disk: spec.tmp_disk.unwrap_or(config.tmp_disk),
            run_jobs: 0,
            comp_jobs: 0,
            no_share_jobs: 0,
        });
    }

    let mut features = FeatureRegistry::default();
    let mut by_feature: BTreeMap<&str, NodeMask> = BTreeMap::new();
    for config in &configs {
        for name in &config.feature_names {
            by_feature
                .entry(name)
                .or_insert_with(|| NodeMask::new(node_count))
                .union(&config.node_mask);
        }
    }
    for (name, mask) in by_feature {
        features.insert(name, mask);
    }

    let resolve_nodes = |names: &[String], owner: &str| -> Result<NodeMask, IoError> {
        let mut mask = NodeMask::new(node_count);
        for name in names {
            let id = node_ids
                .get(name.as_str())
                .ok_or_else(|| IoError::UnknownNode {
                    owner: owner.to_string(),
                    node: name.clone(),
                })?;
            mask.set(id.index());
        }
        Ok(mask)
    };

    let mut partition_ids: BTreeMap<&str, PartitionId> = BTreeMap::new();
    let mut partitions: Vec<PartitionRecord> = Vec::with_capacity(snapshot.partitions.len());
    for (i, spec) in snapshot.partitions.iter().enumerate() {
        let id = PartitionId::new(i as u32);
        if partition_ids.insert(&spec.name, id).is_some() {
            return Err(IoError::DuplicateName {
                kind: "partition",
                name: spec.name.clone(),
            });
        }
        let node_mask = match &spec.nodes {
            Some(names) => resolve_nodes(names, &format!("partition `{}`", spec.name))?,
            None => NodeMask::filled(node_count),
        };
        partitions.push(PartitionRecord {
            id,
            name: spec.name.clone(),
            min_nodes: spec.min_nodes,
            max_nodes: spec.max_nodes.unwrap_or(INFINITE),
            max_time: spec.max_time.unwrap_or(INFINITE),
            default_time: spec.default_time,
            state: match spec.state {
                PartitionStateSpec::Up => PartitionState::Up,
                PartitionStateSpec::Down => PartitionState::Down,
                PartitionStateSpec::Inactive => PartitionState::Inactive,
            },
            max_share: match spec.share {
                ShareSpec::Exclusive => SharePolicy::Exclusive,
                ShareSpec::No => SharePolicy::No,
                ShareSpec::Yes(n) => SharePolicy::Yes(n),
                ShareSpec::Force(n) => SharePolicy::Force(n),
            },
            node_mask,
        });
    }

    let mut reservations = Vec::with_capacity(snapshot.reservations.len());
    for spec in &snapshot.reservations {
        reservations.push(LoadedReservation {
            name: spec.name.clone(),
            node_mask: resolve_nodes(&spec.nodes, &format!("reservation `{}`", spec.name))?,
            start_time: spec.start_time,
            end_time: spec.end_time,
            users: spec.users.clone(),
        });
    }

    let mut cluster = ClusterState {
        nodes,
        configs,
        partitions,
        features,
        licenses: snapshot
            .licenses
            .iter()
            .map(|l| {
                (
                    l.name.clone(),
                    License {
                        total: l.total,
                        in_use: 0,
                    },
                )
            })
            .collect(),
        fast_schedule: snapshot.controller.fast_schedule,
        preemption_enabled: snapshot.controller.preemption_enabled,
        gang_scheduling: snapshot.controller.gang_scheduling,
        ..ClusterState::default()
    };
    cluster.rebuild_masks();

    let mut jobs = Vec::with_capacity(snapshot.jobs.len());
    for spec in &snapshot.jobs {
        let partition = *partition_ids
            .get(spec.partition.as_str())
            .ok_or_else(|| IoError::UnknownPartition {
                owner: format!("job {}", spec.id),
                partition: spec.partition.clone(),
            })?;
        let features = match &spec.features {
            Some(text) => text
                .parse()
                .map_err(|source| IoError::BadFeatures {
                    job: spec.id,
                    source,
                })?,
            None => Default::default(),
        };
        let owner = format!("job {}", spec.id);
        let required = if spec.required_nodes.is_empty() {
            None
        } else {
            Some(resolve_nodes(&spec.required_nodes, &owner)?)
        };
        let excluded = if spec.excluded_nodes.is_empty() {
            None
        } else {
            Some(resolve_nodes(&spec.excluded_nodes, &owner)?)
        };
        let mc = if spec.sockets_per_node.is_some()
            || spec.cores_per_socket.is_some()
            || spec.threads_per_core.is_some()
        {
            Some(MultiCoreSpec {
                sockets_per_node: spec.sockets_per_node,
                cores_per_socket: spec.cores_per_socket,
                threads_per_core: spec.threads_per_core,
            })
        } else {
            None
        };

        let mut job = JobRecord::new(JobId::new(spec.id), partition);
        job.name = spec.name.clone();
        job.user = spec.user.clone();
        job.priority = spec.priority;
        job.time_limit = spec.time_limit;
        job.resv_name = spec.reservation.clone();
        job.preempt_mode = match spec.preempt_mode {
            PreemptModeSpec::Cancel => PreemptMode::Cancel,
            PreemptModeSpec::Checkpoint => PreemptMode::Checkpoint,
            PreemptModeSpec::Requeue => PreemptMode::Requeue,
            PreemptModeSpec::Suspend => PreemptMode::Suspend,
        };
        job.grace_period = spec.grace_period;
        job.ckpt = match spec.checkpoint {
            CkptSpec::Requeue => CkptSupport::Requeue,
            CkptSpec::Vacate => CkptSupport::VacateOnly,
            CkptSpec::None => CkptSupport::Unsupported,
        };
        job.requeue_allowed = spec.requeue_allowed;
        job.licenses = spec.licenses.clone();
        job.details = JobDetails {
            min_cpus: spec.min_cpus,
            pn_min_cpus: spec.pn_min_cpus,
            pn_min_memory: if spec.mem_per_cpu {
                MemoryRequirement::PerCpu(spec.pn_min_memory)
            } else {
                MemoryRequirement::PerNode(spec.pn_min_memory)
            },
            pn_min_tmp_disk: spec.pn_min_tmp_disk,
            min_nodes: spec.min_nodes,
            max_nodes: spec.max_nodes,
            limit_set_max_nodes: false,
            req_node_mask: required,
            exc_node_mask: excluded,
            features,
            mc,
            share_request: match spec.share {
                ShareRequestSpec::Default => ShareRequest::Indifferent,
                ShareRequestSpec::Exclusive => ShareRequest::Exclusive,
                ShareRequestSpec::Shared => ShareRequest::Shared,
            },
            fixed_layout: false,
        };

        if !spec.running_on.is_empty() {
            // Replay an allocation that predates this snapshot.
            let mask = resolve_nodes(&spec.running_on, &owner)?;
            let exclusive = spec.share != ShareRequestSpec::Shared;
            for i in mask.ones() {
                cluster.make_node_alloc(NodeId::new(i as u32), exclusive);
            }
            job.node_names = mask
                .ones()
                .map(|i| cluster.nodes[i].name.clone())
                .collect();
            job.node_cnt = mask.count();
            job.node_mask = Some(mask);
            job.state = JobState::Running;
            job.start_time = snapshot.now;
        }
        jobs.push(job);
    }

    Ok(LoadedSnapshot {
        now: snapshot.now,
        cluster,
        jobs,
        reservations,
        digest,
    })
}
