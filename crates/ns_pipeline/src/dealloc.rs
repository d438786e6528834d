//! Deallocation and termination requests.
//!
//! `deallocate_nodes` moves a job's nodes to COMPLETING, releases its
//! licenses, notifies the oracle and enqueues the matching kill request.
//! Nodes already DOWN get no request and leave the completing bitmap at
//! once. `re_kill_job` rebuilds the request from whatever is still
//! completing when an earlier attempt went unacknowledged.

use tracing::{debug, error, info};

use ns_algo::PlacementOracle;
use ns_core::{JobId, JobRecord, NodeId};

use crate::{AgentMessage, AgentQueue, AgentRequest, Controller};

/// Give back one node's share of the job's CPU count.
fn deduct_node_cpus(job: &mut JobRecord, index: usize) {
    let cpus = job
        .resources
        .as_ref()
        .and_then(|layout| {
            layout
                .node_cpus
                .iter()
                .find(|(id, _)| id.index() == index)
                .map(|(_, cpus)| *cpus)
        })
        .unwrap_or(0);
    job.cpu_cnt = job.cpu_cnt.saturating_sub(cpus);
}

fn push_kill_request(
    agent: &mut AgentQueue,
    message: AgentMessage,
    job: &JobRecord,
    hosts: Vec<String>,
    now: i64,
) {
    agent.push(AgentRequest {
        message,
        job: job.id,
        job_state: job.state,
        user: job.user.clone(),
        hosts,
        timestamp: now,
    });
}

impl<O: PlacementOracle> Controller<O> {
    /// Deallocate a job's nodes into COMPLETING and enqueue the kill
    /// request. `timeout` picks the time-limit variant, `preempted` the
    /// preemption variant; `suspended` means the job's run counts were
    /// already surrendered.
    pub fn deallocate_nodes(
        &mut self,
        job_id: JobId,
        timeout: bool,
        suspended: bool,
        preempted: bool,
        now: i64,
    ) {
        let Some(mut job) = self.jobs.take(job_id) else {
            error!(job = %job_id, "deallocate for unknown job");
            return;
        };
        self.dealloc_inner(&mut job, timeout, suspended, preempted, now);
        self.jobs.insert(job);
    }

    fn dealloc_inner(
        &mut self,
        job: &mut JobRecord,
        timeout: bool,
        suspended: bool,
        preempted: bool,
        now: i64,
    ) {
        self.cluster.license_release(job);
        if let Err(e) = self.oracle.job_fini(job) {
            error!(job = %job.id, error = %e, "select_job_fini failed");
        }

        let message = if timeout {
            AgentMessage::KillTimelimit
        } else if preempted {
            AgentMessage::KillPreempted
        } else {
            AgentMessage::TerminateJob
        };

        let Some(node_mask) = job.node_mask.clone() else {
            error!(job = %job.id, "job allocated no nodes to be killed on");
            return;
        };

        let mut completing = node_mask.clone();
        let mut hosts = Vec::new();
        let mut down_cnt = 0u32;
        for i in node_mask.ones() {
            let id = NodeId::new(i as u32);
            if self.cluster.is_down(id) {
                // No point signalling a dead node; count it done already.
                down_cnt += 1;
                completing.clear(i);
                job.node_cnt = job.node_cnt.saturating_sub(1);
                deduct_node_cpus(job, i);
                continue;
            }
            self.cluster.make_node_comp(id, suspended);
            hosts.push(self.cluster.nodes[i].name.clone());
        }
        job.completing = true;
        job.completing_mask = Some(completing);

        if hosts.is_empty() {
            // Nothing to signal: the job leaves COMPLETING immediately and
            // the scheduler can run another cycle.
            job.completing = false;
            if down_cnt == 0 {
                error!(job = %job.id, "job allocated no nodes to be killed on");
            } else {
                debug!(job = %job.id, down = down_cnt, "all allocated nodes down; skipping kill request");
            }
            return;
        }
        push_kill_request(&mut self.agent, message, job, hosts, now);
    }

    /// Re-issue the terminate request for a job stuck in COMPLETING,
    /// from the completing bitmap only, skipping nodes that went DOWN
    /// (treated as already complete) or stopped responding.
    pub fn re_kill_job(&mut self, job_id: JobId, now: i64) {
        let Some(mut job) = self.jobs.take(job_id) else {
            error!(job = %job_id, "re-kill for unknown job");
            return;
        };
        self.re_kill_inner(&mut job, now);
        self.jobs.insert(job);
    }

    fn re_kill_inner(&mut self, job: &mut JobRecord, now: i64) {
        let Some(completing) = job.completing_mask.clone() else {
            return;
        };
        let mut hosts = Vec::new();
        for i in completing.ones() {
            let id = NodeId::new(i as u32);
            if self.cluster.is_down(id) {
                // Consider the job already complete on this node.
                if let Some(mask) = &mut job.completing_mask {
                    mask.clear(i);
                }
                deduct_node_cpus(job, i);
                job.node_cnt = job.node_cnt.saturating_sub(1);
                let node = &mut self.cluster.nodes[i];
                node.comp_jobs = node.comp_jobs.saturating_sub(1);
                if node.comp_jobs == 0 {
                    node.flags.completing = false;
                    self.cluster.completing_mask.clear(i);
                }
                if job.node_cnt == 0 {
                    job.completing = false;
                }
            } else if !self.cluster.is_no_respond(id) {
                hosts.push(self.cluster.nodes[i].name.clone());
            }
        }
        if hosts.is_empty() {
            return;
        }
        if self.last_rekill_job == Some(job.id) {
            debug!(job = %job.id, hosts = hosts.len(), "resending terminate request");
        } else {
            info!(job = %job.id, hosts = hosts.len(), "resending terminate request");
        }
        self.last_rekill_job = Some(job.id);
        push_kill_request(&mut self.agent, AgentMessage::TerminateJob, job, hosts, now);
    }
}
