//! ns_pipeline — Orchestration of the node-selection pipeline.
//!
//! The [`Controller`] owns the cluster state, the job table, the
//! reservation directory, the placement oracle and the outbound agent
//! queue, and drives the fixed call order:
//!
//! `select_nodes` → admission gate → node-set build → reservation overlay
//! → feature-count expansion (each counted feature picked separately, then
//! a final pick) → on success commit + prolog; on contention preempt and
//! surface busy.
//!
//! A selection call is synchronous and leaves no net mutation behind on
//! failure: temporary overlays are restored on every exit path and the
//! job's saved request fields are reverted unconditionally.

pub mod commit;
pub mod dealloc;
pub mod preempt;
pub mod resv;
pub mod select;

use std::collections::{BTreeMap, VecDeque};

use ns_algo::PlacementOracle;
use ns_core::{ClusterState, JobId, JobRecord, JobState, NodeMask};

pub use resv::{Reservation, ReservationDirectory};

/// Outbound request kinds handed to the agent dispatcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AgentMessage {
    TerminateJob,
    KillTimelimit,
    KillPreempted,
}

/// One enqueued agent request. The dispatcher owns retries; the engine
/// only rebuilds requests via re-kill when acknowledgements are missing.
#[derive(Clone, Debug)]
pub struct AgentRequest {
    pub message: AgentMessage,
    pub job: JobId,
    pub job_state: JobState,
    pub user: String,
    pub hosts: Vec<String>,
    pub timestamp: i64,
}

/// FIFO of requests awaiting the agent dispatcher.
#[derive(Debug, Default)]
pub struct AgentQueue {
    queue: VecDeque<AgentRequest>,
}

impl AgentQueue {
    pub fn push(&mut self, request: AgentRequest) {
        self.queue.push_back(request);
    }

    pub fn drain(&mut self) -> Vec<AgentRequest> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentRequest> {
        self.queue.iter()
    }
}

/// Job registry keyed by id.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: BTreeMap<JobId, JobRecord>,
}

impl JobTable {
    pub fn insert(&mut self, job: JobRecord) {
        self.jobs.insert(job.id, job);
    }

    pub fn get(&self, id: JobId) -> Option<&JobRecord> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut JobRecord> {
        self.jobs.get_mut(&id)
    }

    /// Remove a job for exclusive mutation; pair with [`JobTable::insert`].
    pub fn take(&mut self, id: JobId) -> Option<JobRecord> {
        self.jobs.remove(&id)
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    pub fn pending_ids(&self) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| j.is_pending())
            .map(|j| j.id)
            .collect()
    }
}

/// Successful selection: the chosen nodes, plus what had to give way.
#[derive(Clone, Debug)]
pub struct SelectSuccess {
    pub nodes: NodeMask,
    pub node_names: Vec<String>,
    pub cpu_count: u32,
    pub preempted: Vec<JobId>,
    pub test_only: bool,
}

/// The controller task: single-threaded owner of all scheduling state.
pub struct Controller<O: PlacementOracle> {
    pub cluster: ClusterState,
    pub jobs: JobTable,
    pub reservations: ReservationDirectory,
    pub oracle: O,
    pub agent: AgentQueue,
    pub(crate) last_rekill_job: Option<JobId>,
}

impl<O: PlacementOracle> Controller<O> {
    pub fn new(cluster: ClusterState, oracle: O) -> Self {
        Self {
            cluster,
            jobs: JobTable::default(),
            reservations: ReservationDirectory::default(),
            oracle,
            agent: AgentQueue::default(),
            last_rekill_job: None,
        }
    }
}
