//! Cluster state: the node table, configuration records, feature registry
//! and the derived population bitmaps.
//!
//! Single-writer: only the controller task mutates this, and all bitmap
//! maintenance happens inside the state-transition helpers so the
//! populations stay mutually consistent (`idle ⊆ avail`,
//! `idle ∩ completing = ∅`).

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use crate::bitmap::NodeMask;
use crate::ids::{ConfigId, NodeId, PartitionId};
use crate::job::JobRecord;
use crate::node::{ConfigRecord, NodeRecord, NodeState};
use crate::partition::PartitionRecord;

/// Feature name → nodes carrying it (union over configurations).
#[derive(Clone, Debug, Default)]
pub struct FeatureRegistry {
    map: BTreeMap<String, NodeMask>,
}

impl FeatureRegistry {
    pub fn insert(&mut self, name: impl Into<String>, mask: NodeMask) {
        self.map.insert(name.into(), mask);
    }

    pub fn mask(&self, name: &str) -> Option<&NodeMask> {
        self.map.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }
}

/// Countable site license.
#[derive(Clone, Copy, Debug, Default)]
pub struct License {
    pub total: u32,
    pub in_use: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ClusterState {
    pub nodes: Vec<NodeRecord>,
    pub configs: Vec<ConfigRecord>,
    pub partitions: Vec<PartitionRecord>,
    pub features: FeatureRegistry,
    pub licenses: BTreeMap<String, License>,

    /// Nodes usable for scheduling at all.
    pub avail_mask: NodeMask,
    /// Idle subset of `avail_mask`; never overlaps `completing_mask`.
    pub idle_mask: NodeMask,
    /// Nodes not held exclusively by any job.
    pub share_mask: NodeMask,
    /// Nodes still completing a prior allocation.
    pub completing_mask: NodeMask,
    /// Powered-down (power-save) nodes.
    pub power_mask: NodeMask,

    /// Trust configuration declarations instead of per-node actual counts.
    pub fast_schedule: bool,
    pub preemption_enabled: bool,
    pub gang_scheduling: bool,
}

impl ClusterState {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Fresh all-zero mask of node-table width.
    pub fn zero_mask(&self) -> NodeMask {
        NodeMask::new(self.node_count())
    }

    /// Fresh all-one mask of node-table width.
    pub fn full_mask(&self) -> NodeMask {
        NodeMask::filled(self.node_count())
    }

    pub fn node(&self, id: NodeId) -> &NodeRecord {
        &self.nodes[id.index()]
    }

    pub fn config(&self, id: ConfigId) -> &ConfigRecord {
        &self.configs[id.index()]
    }

    pub fn partition(&self, id: PartitionId) -> &PartitionRecord {
        &self.partitions[id.index()]
    }

    pub fn is_down(&self, id: NodeId) -> bool {
        self.node(id).is_down()
    }

    pub fn is_no_respond(&self, id: NodeId) -> bool {
        self.node(id).is_no_respond()
    }

    pub fn is_configuring(&self, id: NodeId) -> bool {
        self.node(id).is_configuring()
    }

    /// Recompute every population bitmap from node records. Called once
    /// after load; incremental transitions keep them current afterwards.
    pub fn rebuild_masks(&mut self) {
        let n = self.node_count();
        let mut avail = NodeMask::new(n);
        let mut idle = NodeMask::new(n);
        let mut share = NodeMask::new(n);
        let mut completing = NodeMask::new(n);
        let mut power = NodeMask::new(n);

        for (i, node) in self.nodes.iter().enumerate() {
            if node.is_schedulable() {
                avail.set(i);
                if node.is_idle() {
                    idle.set(i);
                }
            }
            if node.no_share_jobs == 0 {
                share.set(i);
            }
            if node.flags.completing {
                completing.set(i);
            }
            if node.flags.power_save {
                power.set(i);
            }
        }

        self.avail_mask = avail;
        self.idle_mask = idle;
        self.share_mask = share;
        self.completing_mask = completing;
        self.power_mask = power;
    }

    /// Transition a node into a job's allocation.
    pub fn make_node_alloc(&mut self, id: NodeId, exclusive: bool) {
        let i = id.index();
        let node = &mut self.nodes[i];
        node.run_jobs += 1;
        node.state = NodeState::Allocated;
        if exclusive {
            node.no_share_jobs += 1;
            self.share_mask.clear(i);
        }
        self.idle_mask.clear(i);
    }

    /// Transition a node out of a job's allocation into COMPLETING.
    /// `suspended` means the job's run count was already surrendered.
    pub fn make_node_comp(&mut self, id: NodeId, suspended: bool) {
        let i = id.index();
        let node = &mut self.nodes[i];
        if !suspended {
            node.run_jobs = node.run_jobs.saturating_sub(1);
        }
        node.comp_jobs += 1;
        node.flags.completing = true;
        if node.run_jobs == 0 {
            node.state = NodeState::Idle;
        } else {
            node.state = NodeState::Mixed;
        }
        self.completing_mask.set(i);
        // COMPLETING nodes are never IDLE.
        self.idle_mask.clear(i);
    }

    /// Completion acknowledged: the node may rejoin the idle population.
    pub fn make_node_idle(&mut self, id: NodeId, was_exclusive: bool) {
        let i = id.index();
        let node = &mut self.nodes[i];
        node.comp_jobs = node.comp_jobs.saturating_sub(1);
        if node.comp_jobs == 0 {
            node.flags.completing = false;
            self.completing_mask.clear(i);
        }
        if was_exclusive {
            node.no_share_jobs = node.no_share_jobs.saturating_sub(1);
            if node.no_share_jobs == 0 {
                self.share_mask.set(i);
            }
        }
        if node.run_jobs == 0 && !node.flags.completing {
            node.state = NodeState::Idle;
            if node.is_schedulable() {
                self.idle_mask.set(i);
            }
        }
    }

    /// Claim the job's licenses. Counts may exceed totals transiently when
    /// forced sharing overcommits; the counter is what accounting reads.
    pub fn license_claim(&mut self, job: &JobRecord) {
        for (name, count) in &job.licenses {
            if let Some(lic) = self.licenses.get_mut(name) {
                lic.in_use += count;
            }
        }
    }

    pub fn license_release(&mut self, job: &JobRecord) {
        for (name, count) in &job.licenses {
            if let Some(lic) = self.licenses.get_mut(name) {
                lic.in_use = lic.in_use.saturating_sub(*count);
            }
        }
    }
}

/// Scoped overlay of the available-node population.
///
/// Swaps `avail_mask` for a restricted copy (typically
/// `avail ∩ reservation`) and guarantees restoration when dropped, on every
/// exit path including early `?` returns.
pub struct AvailOverlay<'a> {
    cluster: &'a mut ClusterState,
    saved: Option<NodeMask>,
}

impl<'a> AvailOverlay<'a> {
    /// Install `restricted` as the available population for the guard's
    /// lifetime.
    pub fn install(cluster: &'a mut ClusterState, restricted: NodeMask) -> Self {
        let saved = std::mem::replace(&mut cluster.avail_mask, restricted);
        Self {
            cluster,
            saved: Some(saved),
        }
    }

    /// No-op overlay: same guard type, nothing swapped.
    pub fn passthrough(cluster: &'a mut ClusterState) -> Self {
        Self {
            cluster,
            saved: None,
        }
    }
}

impl Deref for AvailOverlay<'_> {
    type Target = ClusterState;

    fn deref(&self) -> &ClusterState {
        self.cluster
    }
}

impl DerefMut for AvailOverlay<'_> {
    fn deref_mut(&mut self) -> &mut ClusterState {
        self.cluster
    }
}

impl Drop for AvailOverlay<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.cluster.avail_mask = saved;
        }
    }
}
