//! Node and configuration records.

use crate::bitmap::NodeMask;
use crate::ids::{ConfigId, NodeId};

/// Base operational state of a node. Orthogonal conditions (completing,
/// drain, powered down, ...) live in [`NodeFlags`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// No jobs.
    Idle,
    /// Every schedulable resource claimed.
    Allocated,
    /// Some resources claimed, some free.
    Mixed,
    /// Not usable.
    Down,
}

/// Orthogonal state flags. A node carrying `completing` is never counted as
/// idle, whatever its base state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NodeFlags {
    pub completing: bool,
    pub drain: bool,
    pub fail: bool,
    pub power_save: bool,
    pub no_respond: bool,
}

/// One node: immutable identity plus live counters. The `config` index
/// links to the declared resources shared by the whole configuration line.
#[derive(Clone, Debug)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub addr: String,
    pub config: ConfigId,
    pub state: NodeState,
    pub flags: NodeFlags,
    // Actual counts as registered by the node, which may exceed the
    // configuration's declared counts.
    pub cpus: u32,
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
    pub real_memory: u64,
    pub tmp_disk: u64,
    pub run_jobs: u32,
    pub comp_jobs: u32,
    /// Jobs holding this node exclusively; non-zero removes the node from
    /// the sharable population.
    pub no_share_jobs: u32,
}

impl NodeRecord {
    pub fn is_down(&self) -> bool {
        self.state == NodeState::Down
    }

    pub fn is_no_respond(&self) -> bool {
        self.flags.no_respond
    }

    /// Usable for scheduling: responding, not down, not drained or failing.
    pub fn is_schedulable(&self) -> bool {
        !self.is_down() && !self.flags.drain && !self.flags.fail && !self.flags.no_respond
    }

    pub fn is_idle(&self) -> bool {
        self.state == NodeState::Idle && !self.flags.completing
    }

    /// Allocated while still powered down: booting before the job starts.
    pub fn is_configuring(&self) -> bool {
        self.flags.power_save && self.state == NodeState::Allocated
    }
}

/// A named group of nodes sharing declared resources. Immutable after load.
#[derive(Clone, Debug)]
pub struct ConfigRecord {
    pub id: ConfigId,
    pub name: String,
    pub cpus: u32,
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
    pub real_memory: u64,
    pub tmp_disk: u64,
    /// Scheduling weight; lighter configurations are preferred.
    pub weight: u32,
    /// Feature names declared for every member node.
    pub feature_names: Vec<String>,
    /// Member nodes.
    pub node_mask: NodeMask,
}

impl ConfigRecord {
    pub fn features_string(&self) -> String {
        self.feature_names.join(",")
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.feature_names.iter().any(|f| f == name)
    }
}
