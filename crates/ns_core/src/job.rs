//! Job records.
//!
//! A job is shared, read-mostly state: the selection pipeline mutates it
//! only from the controller task. References to the partition and to nodes
//! are registry indices.

use std::collections::BTreeMap;

use crate::bitmap::NodeMask;
use crate::feature::FeatureExpr;
use crate::ids::{JobId, NodeId, PartitionId};

/// What the submitter asked for regarding node sharing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ShareRequest {
    #[default]
    Indifferent,
    Exclusive,
    Shared,
}

/// Resolved sharing decision; see the partition policy table.
/// `ForcedShare` additionally permits resource overcommit downstream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ShareMode {
    #[default]
    NoShare,
    UserShare,
    ForcedShare,
}

impl ShareMode {
    pub fn is_shared(self) -> bool {
        !matches!(self, ShareMode::NoShare)
    }
}

/// Per-node memory requirement; `PerCpu` scales with the job's minimum
/// per-node CPU count.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryRequirement {
    PerNode(u64),
    PerCpu(u64),
}

impl MemoryRequirement {
    /// Smallest amount a single node must offer.
    pub fn floor_per_node(self, pn_min_cpus: u32) -> u64 {
        match self {
            MemoryRequirement::PerNode(mb) => mb,
            MemoryRequirement::PerCpu(mb) => mb * u64::from(pn_min_cpus),
        }
    }
}

impl Default for MemoryRequirement {
    fn default() -> Self {
        MemoryRequirement::PerNode(0)
    }
}

/// Topology minima; `None` fields are unconstrained.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MultiCoreSpec {
    pub sockets_per_node: Option<u16>,
    pub cores_per_socket: Option<u16>,
    pub threads_per_core: Option<u16>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Suspended,
    Complete,
    Cancelled,
}

/// Why a pending job is pending.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StateReason {
    #[default]
    None,
    Held,
    HeldUser,
    PartitionDown,
    PartitionInactive,
    PartitionTimeLimit,
    PartitionNodeLimit,
    QosUsageThreshold,
    Resources,
    NodesRequiredDown,
    Reservation,
}

/// Configured preemption mode of a potential victim.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PreemptMode {
    #[default]
    Cancel,
    Checkpoint,
    Requeue,
    Suspend,
    Unknown,
}

/// What the job's checkpoint machinery supports.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CkptSupport {
    /// Checkpoint-and-requeue works.
    Requeue,
    /// Only checkpoint-and-vacate works.
    VacateOnly,
    #[default]
    Unsupported,
}

/// QoS exemptions and thresholds consulted by the admission gate.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QosPolicy {
    pub exempt_part_time_limit: bool,
    pub exempt_part_min_nodes: bool,
    pub exempt_part_max_nodes: bool,
    /// Job is held below this fair-share usage factor.
    pub usage_threshold: Option<f64>,
}

/// The resource ask: per-node minima, node-count bounds, constraints.
#[derive(Clone, Debug, Default)]
pub struct JobDetails {
    /// Minimum total CPUs across the allocation.
    pub min_cpus: u32,
    pub pn_min_cpus: u32,
    pub pn_min_memory: MemoryRequirement,
    pub pn_min_tmp_disk: u64,
    pub min_nodes: u32,
    /// Zero means "no explicit maximum".
    pub max_nodes: u32,
    /// True when `max_nodes` came from a limit rather than the submitter.
    pub limit_set_max_nodes: bool,
    pub req_node_mask: Option<NodeMask>,
    pub exc_node_mask: Option<NodeMask>,
    pub features: FeatureExpr,
    pub mc: Option<MultiCoreSpec>,
    pub share_request: ShareRequest,
    /// Set when an external scheduler supplied a fixed per-node layout, in
    /// which case feature counts are not expanded here.
    pub fixed_layout: bool,
}

/// Concrete per-node resource layout produced by the placement oracle.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobLayout {
    pub node_cpus: Vec<(NodeId, u32)>,
}

impl JobLayout {
    pub fn total_cpus(&self) -> u32 {
        self.node_cpus.iter().map(|(_, c)| c).sum()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.node_cpus.iter().map(|(id, _)| *id)
    }
}

#[derive(Clone, Debug)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub user: String,
    pub partition: PartitionId,
    pub resv_name: Option<String>,
    /// Zero means held by user or administrator.
    pub priority: u32,
    /// Minutes; `None` defers to the partition default.
    pub time_limit: Option<u32>,
    pub details: JobDetails,
    pub state: JobState,
    pub state_reason: StateReason,
    pub completing: bool,
    pub configuring: bool,
    /// Sharing decision resolved during the last selection attempt.
    pub resolved_share: ShareMode,
    pub preempt_mode: PreemptMode,
    /// Seconds of grace before a preemption-cancel is enforced.
    pub grace_period: u32,
    pub preempt_time: Option<i64>,
    pub ckpt: CkptSupport,
    pub requeue_allowed: bool,
    pub qos: Option<QosPolicy>,
    /// Effective fair-share priority factor, when computed.
    pub fair_share_factor: Option<f64>,
    /// Verdict of the accounting-policy predicate for this cycle.
    pub acct_policy_ok: bool,
    pub licenses: BTreeMap<String, u32>,
    /// Allocated nodes; `None` while pending.
    pub node_mask: Option<NodeMask>,
    /// Nodes still completing a past allocation.
    pub completing_mask: Option<NodeMask>,
    pub node_names: Vec<String>,
    pub node_addrs: Vec<String>,
    pub batch_host: Option<String>,
    pub node_cnt: u32,
    pub cpu_cnt: u32,
    pub total_cpus: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub resources: Option<JobLayout>,
}

impl JobRecord {
    pub fn new(id: JobId, partition: PartitionId) -> Self {
        Self {
            id,
            name: String::new(),
            user: String::new(),
            partition,
            resv_name: None,
            priority: 100,
            time_limit: None,
            details: JobDetails {
                min_cpus: 1,
                pn_min_cpus: 1,
                min_nodes: 1,
                ..JobDetails::default()
            },
            state: JobState::Pending,
            state_reason: StateReason::None,
            completing: false,
            configuring: false,
            resolved_share: ShareMode::NoShare,
            preempt_mode: PreemptMode::Cancel,
            grace_period: 0,
            preempt_time: None,
            ckpt: CkptSupport::Unsupported,
            requeue_allowed: true,
            qos: None,
            fair_share_factor: None,
            acct_policy_ok: true,
            licenses: BTreeMap::new(),
            node_mask: None,
            completing_mask: None,
            node_names: Vec::new(),
            node_addrs: Vec::new(),
            batch_host: None,
            node_cnt: 0,
            cpu_cnt: 0,
            total_cpus: 0,
            start_time: 0,
            end_time: 0,
            resources: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.priority == 0
    }

    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }
}
