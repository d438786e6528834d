//! Serde model of a cluster snapshot.
//!
//! Names link records together in the file; the loader resolves them into
//! registry indices. Defaults keep hand-written snapshots short.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_priority() -> u32 {
    100
}

fn one() -> u32 {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    /// Controller clock at capture time (unix seconds).
    pub now: i64,
    #[serde(default)]
    pub controller: ControllerSpec,
    pub configs: Vec<ConfigSpec>,
    pub nodes: Vec<NodeSpec>,
    pub partitions: Vec<PartitionSpec>,
    #[serde(default)]
    pub reservations: Vec<ReservationSpec>,
    #[serde(default)]
    pub licenses: Vec<LicenseSpec>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSpec {
    /// Trust configuration declarations over per-node actual counts.
    #[serde(default = "default_true")]
    pub fast_schedule: bool,
    #[serde(default)]
    pub preemption_enabled: bool,
    #[serde(default)]
    pub gang_scheduling: bool,
}

impl Default for ControllerSpec {
    fn default() -> Self {
        Self {
            fast_schedule: true,
            preemption_enabled: false,
            gang_scheduling: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSpec {
    pub name: String,
    pub cpus: u32,
    #[serde(default = "one16")]
    pub sockets: u16,
    #[serde(default = "one16")]
    pub cores: u16,
    #[serde(default = "one16")]
    pub threads: u16,
    pub real_memory: u64,
    #[serde(default)]
    pub tmp_disk: u64,
    #[serde(default = "one")]
    pub weight: u32,
    #[serde(default)]
    pub features: Vec<String>,
}

fn one16() -> u16 {
    1
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateSpec {
    #[default]
    Idle,
    Allocated,
    Mixed,
    Down,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub addr: String,
    /// Configuration line this node belongs to.
    pub config: String,
    #[serde(default)]
    pub state: NodeStateSpec,
    #[serde(default)]
    pub drain: bool,
    #[serde(default)]
    pub power_save: bool,
    #[serde(default)]
    pub no_respond: bool,
    /// Actual registered counts; default to the configuration's values.
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub real_memory: Option<u64>,
    #[serde(default)]
    pub tmp_disk: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStateSpec {
    #[default]
    Up,
    Down,
    Inactive,
}

/// Sharing policy in the file: `exclusive`, `no`, `yes:N`, `force:N`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "per_node")]
pub enum ShareSpec {
    Exclusive,
    No,
    Yes(u16),
    Force(u16),
}

impl Default for ShareSpec {
    fn default() -> Self {
        ShareSpec::No
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionSpec {
    pub name: String,
    #[serde(default = "one")]
    pub min_nodes: u32,
    /// Absent means unlimited.
    #[serde(default)]
    pub max_nodes: Option<u32>,
    /// Minutes; absent means unlimited.
    #[serde(default)]
    pub max_time: Option<u32>,
    #[serde(default)]
    pub default_time: Option<u32>,
    #[serde(default)]
    pub state: PartitionStateSpec,
    #[serde(default)]
    pub share: ShareSpec,
    /// Member node names; absent means every node.
    #[serde(default)]
    pub nodes: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReservationSpec {
    pub name: String,
    pub nodes: Vec<String>,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub users: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LicenseSpec {
    pub name: String,
    pub total: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareRequestSpec {
    #[default]
    Default,
    Exclusive,
    Shared,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptModeSpec {
    #[default]
    Cancel,
    Checkpoint,
    Requeue,
    Suspend,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CkptSpec {
    Requeue,
    Vacate,
    #[default]
    None,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub user: String,
    pub partition: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Minutes; absent defers to the partition default.
    #[serde(default)]
    pub time_limit: Option<u32>,
    #[serde(default = "one")]
    pub min_nodes: u32,
    /// Zero (the default) means no explicit maximum.
    #[serde(default)]
    pub max_nodes: u32,
    #[serde(default = "one")]
    pub min_cpus: u32,
    #[serde(default = "one")]
    pub pn_min_cpus: u32,
    #[serde(default)]
    pub pn_min_memory: u64,
    /// Interpret `pn_min_memory` per CPU instead of per node.
    #[serde(default)]
    pub mem_per_cpu: bool,
    #[serde(default)]
    pub pn_min_tmp_disk: u64,
    #[serde(default)]
    pub sockets_per_node: Option<u16>,
    #[serde(default)]
    pub cores_per_socket: Option<u16>,
    #[serde(default)]
    pub threads_per_core: Option<u16>,
    /// Feature expression, e.g. `"4*gpu&bigmem"` or `"[fs1|fs2]"`.
    #[serde(default)]
    pub features: Option<String>,
    #[serde(default)]
    pub required_nodes: Vec<String>,
    #[serde(default)]
    pub excluded_nodes: Vec<String>,
    #[serde(default)]
    pub share: ShareRequestSpec,
    #[serde(default)]
    pub reservation: Option<String>,
    #[serde(default)]
    pub preempt_mode: PreemptModeSpec,
    #[serde(default)]
    pub grace_period: u32,
    #[serde(default)]
    pub checkpoint: CkptSpec,
    #[serde(default = "default_true")]
    pub requeue_allowed: bool,
    /// Nodes the job is already running on; marks the job RUNNING and the
    /// nodes allocated at load time.
    #[serde(default)]
    pub running_on: Vec<String>,
    #[serde(default)]
    pub licenses: std::collections::BTreeMap<String, u32>,
}
