//! Preemption driver.
//!
//! Applies each victim's configured mode. The checkpoint chain is
//! explicit: checkpoint-requeue, then checkpoint-vacate, then the kill
//! signal that also backstops every other failed action. Gang-suspended
//! victims are the gang scheduler's business and are not counted as
//! actioned, so a selection that only displaces gang jobs proceeds to
//! commit.

use thiserror::Error;
use tracing::{debug, error, info};

use ns_algo::PlacementOracle;
use ns_core::{CkptSupport, JobId, JobState, PreemptMode};

use crate::Controller;

#[derive(Clone, Copy, Debug, Error)]
enum PreemptError {
    #[error("checkpoint not supported")]
    CheckpointUnsupported,
    #[error("requeue not permitted")]
    RequeueForbidden,
    #[error("job vanished")]
    Missing,
}

impl<O: PlacementOracle> Controller<O> {
    /// Action every victim; returns whether any job was actually disturbed
    /// (the caller then surfaces busy and retries next cycle).
    pub(crate) fn preempt_jobs(&mut self, victims: &[JobId], now: i64) -> bool {
        let mut actioned = 0u32;
        for &victim_id in victims {
            let Some(victim) = self.jobs.get(victim_id) else {
                continue;
            };
            if !victim.is_running() && victim.state != JobState::Suspended {
                continue;
            }
            let mode = victim.preempt_mode;
            let mut rc: Result<(), PreemptError> = Ok(());
            match mode {
                PreemptMode::Cancel => {
                    actioned += 1;
                    if self.grant_grace(victim_id, now) {
                        continue;
                    }
                    rc = self.kill_victim(victim_id, now);
                    if rc.is_ok() {
                        info!(job = %victim_id, "preempted job has been killed");
                    }
                }
                PreemptMode::Checkpoint => {
                    actioned += 1;
                    rc = self.checkpoint_victim(victim_id, now);
                    if rc.is_ok() {
                        info!(job = %victim_id, "preempted job has been checkpointed");
                    }
                }
                PreemptMode::Requeue => {
                    actioned += 1;
                    rc = self.requeue_victim(victim_id, now);
                    if rc.is_ok() {
                        info!(job = %victim_id, "preempted job has been requeued");
                    }
                }
                PreemptMode::Suspend => {
                    if self.cluster.gang_scheduling {
                        debug!(job = %victim_id, "preempted job suspended by gang scheduler");
                    } else {
                        error!(job = %victim_id, "suspend preemption without gang scheduling");
                    }
                }
                PreemptMode::Unknown => {
                    error!(job = %victim_id, "invalid preemption mode");
                }
            }

            if let Err(e) = rc {
                debug!(job = %victim_id, error = %e, "preemption action failed");
                if self.kill_victim(victim_id, now).is_ok() {
                    info!(job = %victim_id, "preempted job had to be killed");
                } else {
                    info!(job = %victim_id, "preempted job kill failure");
                }
            }
        }
        actioned > 0
    }

    /// First cancel attempt starts the grace clock; the kill lands once
    /// the grace period has run out.
    fn grant_grace(&mut self, victim_id: JobId, now: i64) -> bool {
        let Some(victim) = self.jobs.get_mut(victim_id) else {
            return false;
        };
        if victim.grace_period == 0 {
            return false;
        }
        match victim.preempt_time {
            None => {
                victim.preempt_time = Some(now);
                true
            }
            Some(started) => now < started + i64::from(victim.grace_period),
        }
    }

    fn kill_victim(&mut self, victim_id: JobId, now: i64) -> Result<(), PreemptError> {
        let suspended = {
            let victim = self.jobs.get_mut(victim_id).ok_or(PreemptError::Missing)?;
            let suspended = victim.state == JobState::Suspended;
            victim.state = JobState::Cancelled;
            suspended
        };
        self.deallocate_nodes(victim_id, false, suspended, true, now);
        Ok(())
    }

    /// Checkpoint-requeue, falling back to checkpoint-vacate.
    fn checkpoint_victim(&mut self, victim_id: JobId, now: i64) -> Result<(), PreemptError> {
        let support = self
            .jobs
            .get(victim_id)
            .ok_or(PreemptError::Missing)?
            .ckpt;
        match support {
            CkptSupport::Requeue => {
                let suspended = {
                    let victim = self.jobs.get_mut(victim_id).ok_or(PreemptError::Missing)?;
                    victim.state == JobState::Suspended
                };
                self.deallocate_nodes(victim_id, false, suspended, true, now);
                if let Some(victim) = self.jobs.get_mut(victim_id) {
                    victim.state = JobState::Pending;
                }
                Ok(())
            }
            CkptSupport::VacateOnly => {
                debug!(job = %victim_id, "checkpoint-requeue unsupported; vacating");
                self.kill_victim(victim_id, now)
            }
            CkptSupport::Unsupported => Err(PreemptError::CheckpointUnsupported),
        }
    }

    fn requeue_victim(&mut self, victim_id: JobId, now: i64) -> Result<(), PreemptError> {
        let (allowed, suspended) = {
            let victim = self.jobs.get(victim_id).ok_or(PreemptError::Missing)?;
            (victim.requeue_allowed, victim.state == JobState::Suspended)
        };
        if !allowed {
            return Err(PreemptError::RequeueForbidden);
        }
        self.deallocate_nodes(victim_id, false, suspended, true, now);
        if let Some(victim) = self.jobs.get_mut(victim_id) {
            victim.state = JobState::Pending;
        }
        Ok(())
    }
}
