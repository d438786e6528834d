//! Node-set building.
//!
//! Walks the configuration records and groups candidate nodes into *node
//! sets*: per-configuration groups that pass the job's scalar and topology
//! minima, intersected with the partition and the usable mask (reservation
//! ∩ excluded-complement ∩ feature result). Sets overlapping the
//! powered-down population are split so that powered-down nodes sort
//! strictly after every powered-up node. The result is ordered by
//! non-decreasing weight.

use tracing::{debug, info};

use ns_core::{
    ClusterState, ConfigRecord, JobDetails, JobRecord, NodeMask, NodeRecord, PartitionRecord,
    SelectionError, MAX_FEATURES,
};

use crate::features::{evaluate_feature_counts, xor_alternatives};

/// One weight tier of candidate nodes sharing a configuration.
/// Owned by the selection call that built it; the picker consumes the
/// member mask destructively.
#[derive(Clone, Debug)]
pub struct NodeSet {
    /// Minimum CPUs per member node. Without fast-schedule, individual
    /// nodes may actually have more.
    pub cpus_per_node: u32,
    pub real_memory: u64,
    pub nodes: u32,
    pub weight: u32,
    pub features: String,
    /// Exclusive-alternative bits served by this set.
    pub feature_bits: NodeMask,
    /// Member nodes.
    pub node_mask: NodeMask,
}

/// True when the configuration's declared resources cannot satisfy the
/// job's per-node minima. Unspecified topology fields never fail.
fn config_too_small(details: &JobDetails, config: &ConfigRecord) -> bool {
    if details.pn_min_cpus > config.cpus
        || details.pn_min_memory.floor_per_node(details.pn_min_cpus) > config.real_memory
        || details.pn_min_tmp_disk > config.tmp_disk
    {
        return true;
    }
    if let Some(mc) = &details.mc {
        if mc.sockets_per_node.is_some_and(|s| s > config.sockets)
            || mc.cores_per_socket.is_some_and(|c| c > config.cores)
            || mc.threads_per_core.is_some_and(|t| t > config.threads)
        {
            return true;
        }
    }
    false
}

/// Same test against a node's actual registered counts.
fn node_too_small(details: &JobDetails, node: &NodeRecord) -> bool {
    if details.pn_min_cpus > node.cpus
        || details.pn_min_memory.floor_per_node(details.pn_min_cpus) > node.real_memory
        || details.pn_min_tmp_disk > node.tmp_disk
    {
        return true;
    }
    if let Some(mc) = &details.mc {
        if mc.sockets_per_node.is_some_and(|s| s > node.sockets)
            || mc.cores_per_socket.is_some_and(|c| c > node.cores)
            || mc.threads_per_core.is_some_and(|t| t > node.threads)
        {
            return true;
        }
    }
    false
}

/// Deferred per-node re-filter: nodes can register with more resources
/// than their configuration declares, so without fast-schedule the final
/// word comes from the actual counts.
fn filter_nodes_in_set(mask: &mut NodeMask, details: &JobDetails, cluster: &ClusterState) {
    let members: Vec<usize> = mask.ones().collect();
    for i in members {
        if node_too_small(details, &cluster.nodes[i]) {
            mask.clear(i);
        }
    }
}

/// Build the weight-ordered node-set list for a job.
///
/// `usable_mask` carries the reservation restriction when the job names
/// one; the excluded-node complement and the feature fold are applied
/// here. Returns `InfeasibleFeatures` when the feature counts can never be
/// met and `InfeasibleConfig` when no set survives.
pub fn build_node_sets(
    job: &JobRecord,
    part: &PartitionRecord,
    cluster: &ClusterState,
    usable_mask: Option<NodeMask>,
) -> Result<Vec<NodeSet>, SelectionError> {
    let details = &job.details;

    let mut usable = usable_mask.unwrap_or_else(|| cluster.full_mask());
    if let Some(exc) = &details.exc_node_mask {
        usable.subtract(exc);
    }

    let has_xor = evaluate_feature_counts(&details.features, &cluster.features, &mut usable)
        .map_err(|e| {
            info!(job = %job.id, "feature requirements can not be met");
            e
        })?;

    let mut sets: Vec<NodeSet> = Vec::new();
    let mut max_weight = 0u32;

    for config in &cluster.configs {
        let too_small = config_too_small(details, config);
        // With fast-schedule the declared counts are authoritative; without
        // it, a failing configuration may still contain usable nodes and is
        // re-examined per node below.
        if cluster.fast_schedule && too_small {
            continue;
        }
        let check_node_config = !cluster.fast_schedule && too_small;

        let mut mask = config.node_mask.clone();
        mask.intersect(&part.node_mask);
        mask.intersect(&usable);
        if check_node_config && mask.any() {
            filter_nodes_in_set(&mut mask, details, cluster);
        }
        let nodes = mask.count();
        if nodes == 0 {
            continue;
        }

        let feature_bits = if has_xor {
            let bits = xor_alternatives(&details.features, &cluster.features, &config.node_mask);
            if !bits.any() {
                continue;
            }
            bits
        } else {
            // AND/OR features were already folded into `usable`.
            let mut bits = NodeMask::new(MAX_FEATURES);
            bits.set(0);
            bits
        };

        debug!(
            config = %config.name,
            nodes,
            weight = config.weight,
            "usable nodes from configuration"
        );
        max_weight = max_weight.max(config.weight);
        sets.push(NodeSet {
            cpus_per_node: config.cpus,
            real_memory: config.real_memory,
            nodes,
            weight: config.weight,
            features: config.features_string(),
            feature_bits,
            node_mask: mask,
        });
    }

    if sets.is_empty() {
        info!(job = %job.id, "no nodes satisfy job requirements");
        return Err(SelectionError::InfeasibleConfig);
    }

    // Powered-down members are penalized past every powered-up set so they
    // are only reached when nothing else fits.
    let base_len = sets.len();
    for i in 0..base_len {
        let power_cnt = sets[i].node_mask.overlap_count(&cluster.power_mask);
        if power_cnt == 0 {
            continue;
        }
        if power_cnt == sets[i].nodes {
            sets[i].weight += max_weight;
            continue;
        }

        // Mixed set: split into powered-up and powered-down halves.
        let mut powered_down = sets[i].clone();
        powered_down.node_mask.intersect(&cluster.power_mask);
        powered_down.nodes = power_cnt;
        powered_down.weight = sets[i].weight + max_weight;

        sets[i].node_mask.subtract(&cluster.power_mask);
        sets[i].nodes -= power_cnt;
        sets.push(powered_down);
    }

    sets.sort_by_key(|s| s.weight);
    Ok(sets)
}

/// Confirm that every explicitly required node appears in some set.
pub fn required_in_sets(req_mask: &NodeMask, sets: &[NodeSet]) -> Result<(), SelectionError> {
    let mut scratch = NodeMask::new(req_mask.len());
    for set in sets {
        scratch.union(&set.node_mask);
    }
    if req_mask.is_subset_of(&scratch) {
        Ok(())
    } else {
        Err(SelectionError::InfeasibleConfig)
    }
}

/// Clear from `avail` every node that cannot serve the job: resource
/// minima, topology and feature constraints. Used by external schedulers
/// probing on their own; exclusive-OR groups are not expanded here (the
/// union of alternatives is accepted).
pub fn job_req_node_filter(
    job: &JobRecord,
    cluster: &ClusterState,
    avail: &mut NodeMask,
) -> Result<(), SelectionError> {
    let details = &job.details;
    let members: Vec<usize> = avail.ones().collect();
    for i in members {
        let node = &cluster.nodes[i];
        let reject = if cluster.fast_schedule {
            config_too_small(details, cluster.config(node.config))
        } else {
            node_too_small(details, node)
        };
        if reject {
            avail.clear(i);
        }
    }
    evaluate_feature_counts(&details.features, &cluster.features, avail)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use ns_core::{
        ConfigId, FeatureRegistry, JobId, MemoryRequirement, MultiCoreSpec, NodeFlags, NodeId,
        NodeState, PartitionId,
    };

    /// Cluster of `specs.len()` configurations; each entry is
    /// (node_count, cpus, memory, weight, features).
    fn cluster_of(specs: &[(usize, u32, u64, u32, &[&str])]) -> ClusterState {
        let mut cluster = ClusterState::default();
        let total: usize = specs.iter().map(|s| s.0).sum();
        let mut next = 0usize;
        for (ci, (count, cpus, memory, weight, feats)) in specs.iter().enumerate() {
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
                    sockets: 2,
                    cores: 4,
                    threads: 1,
                    real_memory: *memory,
                    tmp_disk: 1024,
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
                sockets: 2,
                cores: 4,
                threads: 1,
                real_memory: *memory,
                tmp_disk: 1024,
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

    fn job(cluster: &ClusterState) -> JobRecord {
        let _ = cluster;
        JobRecord::new(JobId::new(1), PartitionId::new(0))
    }

    #[test]
    fn sets_come_out_weight_sorted() {
        let cluster = cluster_of(&[
            (2, 8, 8192, 50, &[]),
            (2, 4, 4096, 10, &[]),
            (2, 16, 16384, 30, &[]),
        ]);
        let j = job(&cluster);
        let sets =
            build_node_sets(&j, cluster.partition(PartitionId::new(0)), &cluster, None).unwrap();
        let weights: Vec<u32> = sets.iter().map(|s| s.weight).collect();
        assert_eq!(weights, vec![10, 30, 50]);
    }

    #[test]
    fn scalar_filter_drops_small_configs() {
        let cluster = cluster_of(&[(2, 4, 4096, 1, &[]), (2, 16, 32768, 2, &[])]);
        let mut j = job(&cluster);
        j.details.pn_min_cpus = 8;
        j.details.pn_min_memory = MemoryRequirement::PerNode(16384);
        let sets =
            build_node_sets(&j, cluster.partition(PartitionId::new(0)), &cluster, None).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].cpus_per_node, 16);
    }

    #[test]
    fn per_cpu_memory_scales_with_min_cpus() {
        let cluster = cluster_of(&[(2, 8, 8192, 1, &[])]);
        let mut j = job(&cluster);
        j.details.pn_min_cpus = 4;
        j.details.pn_min_memory = MemoryRequirement::PerCpu(4096); // 16 GiB floor
        assert_eq!(
            build_node_sets(&j, cluster.partition(PartitionId::new(0)), &cluster, None)
                .unwrap_err(),
            SelectionError::InfeasibleConfig
        );
    }

    #[test]
    fn unspecified_topology_never_fails() {
        let cluster = cluster_of(&[(2, 4, 4096, 1, &[])]);
        let mut j = job(&cluster);
        j.details.mc = Some(MultiCoreSpec {
            sockets_per_node: None,
            cores_per_socket: Some(4),
            threads_per_core: None,
        });
        assert!(
            build_node_sets(&j, cluster.partition(PartitionId::new(0)), &cluster, None).is_ok()
        );
    }

    #[test]
    fn deferred_filter_keeps_overprovisioned_nodes() {
        let mut cluster = cluster_of(&[(2, 4, 4096, 1, &[])]);
        cluster.fast_schedule = false;
        // One node registered with more CPUs than the configuration line.
        cluster.nodes[1].cpus = 16;
        let mut j = job(&cluster);
        j.details.pn_min_cpus = 8;
        let sets =
            build_node_sets(&j, cluster.partition(PartitionId::new(0)), &cluster, None).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].node_mask.ones().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn excluded_nodes_leave_the_candidate_pool() {
        let cluster = cluster_of(&[(4, 4, 4096, 1, &[])]);
        let mut j = job(&cluster);
        let mut exc = cluster.zero_mask();
        exc.set(0);
        exc.set(1);
        j.details.exc_node_mask = Some(exc);
        let sets =
            build_node_sets(&j, cluster.partition(PartitionId::new(0)), &cluster, None).unwrap();
        assert_eq!(sets[0].node_mask.ones().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn powered_down_split_penalizes_and_splits() {
        let mut cluster = cluster_of(&[(4, 4, 4096, 10, &[]), (2, 8, 8192, 40, &[])]);
        // Nodes 2,3 of the first configuration are powered down.
        cluster.nodes[2].flags.power_save = true;
        cluster.nodes[3].flags.power_save = true;
        cluster.rebuild_masks();

        let j = job(&cluster);
        let sets =
            build_node_sets(&j, cluster.partition(PartitionId::new(0)), &cluster, None).unwrap();
        assert_eq!(sets.len(), 3);
        // Powered-up half keeps weight 10; split half carries 10 + 40.
        assert_eq!(sets[0].weight, 10);
        assert_eq!(sets[0].node_mask.ones().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(sets[1].weight, 40);
        assert_eq!(sets[2].weight, 50);
        assert_eq!(sets[2].node_mask.ones().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn xor_sets_carry_one_alternative_each() {
        let cluster = cluster_of(&[(2, 4, 4096, 1, &["fs1"]), (2, 4, 4096, 1, &["fs2"])]);
        let mut j = job(&cluster);
        j.details.features = "[fs1|fs2]".parse().unwrap();
        let sets =
            build_node_sets(&j, cluster.partition(PartitionId::new(0)), &cluster, None).unwrap();
        assert_eq!(sets.len(), 2);
        let bits: Vec<Vec<usize>> = sets
            .iter()
            .map(|s| s.feature_bits.ones().collect())
            .collect();
        assert!(bits.contains(&vec![0]));
        assert!(bits.contains(&vec![1]));
    }

    #[test]
    fn request_filter_clears_unfit_nodes() {
        let mut cluster = cluster_of(&[(2, 4, 4096, 1, &["gpu"]), (2, 16, 16384, 2, &[])]);
        cluster.fast_schedule = false;
        cluster.nodes[1].cpus = 32; // registered above its configuration

        let mut j = job(&cluster);
        j.details.pn_min_cpus = 8;
        let mut avail = cluster.full_mask();
        job_req_node_filter(&j, &cluster, &mut avail).unwrap();
        assert_eq!(avail.ones().collect::<Vec<_>>(), vec![1, 2, 3]);

        // Feature folding applies on top of the scalar filter.
        j.details.features = "gpu".parse().unwrap();
        let mut avail = cluster.full_mask();
        job_req_node_filter(&j, &cluster, &mut avail).unwrap();
        assert_eq!(avail.ones().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn required_in_sets_rejects_outsiders() {
        let cluster = cluster_of(&[(2, 4, 4096, 1, &[]), (2, 16, 16384, 2, &[])]);
        let mut j = job(&cluster);
        j.details.pn_min_cpus = 8; // only the second configuration fits
        let sets =
            build_node_sets(&j, cluster.partition(PartitionId::new(0)), &cluster, None).unwrap();

        let mut req = cluster.zero_mask();
        req.set(0); // member of the filtered-out configuration
        assert_eq!(
            required_in_sets(&req, &sets),
            Err(SelectionError::InfeasibleConfig)
        );
        let mut req = cluster.zero_mask();
        req.set(2);
        assert!(required_in_sets(&req, &sets).is_ok());
    }

    proptest! {
        /// Weight monotonicity over arbitrary weight assignments.
        #[test]
        fn built_lists_are_weight_monotone(
            weights in proptest::collection::vec(1u32..1000, 1..6),
            power in proptest::collection::btree_set(0usize..12, 0..6),
        ) {
            let specs: Vec<(usize, u32, u64, u32, &[&str])> = weights
                .iter()
                .map(|w| (2usize, 4u32, 4096u64, *w, &[] as &[&str]))
                .collect();
            let mut cluster = cluster_of(&specs);
            for i in power {
                if i < cluster.nodes.len() {
                    cluster.nodes[i].flags.power_save = true;
                }
            }
            cluster.rebuild_masks();
            let j = job(&cluster);
            let sets = build_node_sets(
                &j,
                cluster.partition(PartitionId::new(0)),
                &cluster,
                None,
            )
            .unwrap();
            for pair in sets.windows(2) {
                prop_assert!(pair[0].weight <= pair[1].weight);
            }
            // Every powered-down member outweighs every powered-up member.
            let max_up = sets
                .iter()
                .filter(|s| !s.node_mask.overlaps(&cluster.power_mask))
                .map(|s| s.weight)
                .max();
            let min_down = sets
                .iter()
                .filter(|s| s.node_mask.overlaps(&cluster.power_mask))
                .map(|s| s.weight)
                .min();
            if let (Some(up), Some(down)) = (max_up, min_down) {
                prop_assert!(down > up);
            }
        }
    }
}
