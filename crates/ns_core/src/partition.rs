//! Partition records: admission bounds and the node-sharing policy.

use crate::bitmap::NodeMask;
use crate::ids::PartitionId;
use crate::INFINITE;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartitionState {
    Up,
    Down,
    Inactive,
}

/// Partition-level node sharing policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SharePolicy {
    /// Nodes are always allocated whole.
    Exclusive,
    /// One job per node unless consumable resources say otherwise.
    No,
    /// Sharing permitted up to `n` jobs per node when requested.
    Yes(u16),
    /// Sharing imposed on every job, up to `n` per node.
    Force(u16),
}

#[derive(Clone, Debug)]
pub struct PartitionRecord {
    pub id: PartitionId,
    pub name: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Minutes; `INFINITE` when uncapped.
    pub max_time: u32,
    /// Minutes; applied to jobs that specify no limit.
    pub default_time: Option<u32>,
    pub state: PartitionState,
    pub max_share: SharePolicy,
    pub node_mask: NodeMask,
}

impl PartitionRecord {
    pub fn is_up(&self) -> bool {
        self.state == PartitionState::Up
    }

    /// Effective time limit for a job requesting `limit` minutes.
    pub fn effective_time_limit(&self, limit: Option<u32>) -> u32 {
        match limit {
            Some(minutes) => minutes,
            None => self.default_time.unwrap_or(self.max_time),
        }
    }
}

impl Default for PartitionRecord {
    fn default() -> Self {
        Self {
            id: PartitionId::new(0),
            name: String::new(),
            min_nodes: 1,
            max_nodes: INFINITE,
            max_time: INFINITE,
            default_time: None,
            state: PartitionState::Up,
            max_share: SharePolicy::No,
            node_mask: NodeMask::default(),
        }
    }
}
