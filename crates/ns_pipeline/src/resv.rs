//! Reservation overlay.
//!
//! Two probe flavors:
//!
//! - A job *naming* a reservation gets that reservation's node mask as its
//!   usable universe up front, or a permanent error when the reservation
//!   has lapsed or denies access.
//! - A job *without* a reservation is confined to nodes not claimed by
//!   reservations it cannot use within its expected run window; the caller
//!   installs the result over `avail` for the duration of the selection
//!   call via [`ns_core::AvailOverlay`].

use ns_core::{JobRecord, NodeMask, SelectionError};

#[derive(Clone, Debug)]
pub struct Reservation {
    pub name: String,
    pub node_mask: NodeMask,
    pub start_time: i64,
    pub end_time: i64,
    /// Users allowed in; empty means open to all.
    pub users: Vec<String>,
}

impl Reservation {
    fn admits(&self, job: &JobRecord) -> bool {
        self.users.is_empty() || self.users.iter().any(|u| *u == job.user)
    }

    /// Reservation claims its nodes inside the job's run window.
    fn blocks_window(&self, now: i64, horizon: i64) -> bool {
        self.start_time < horizon && self.end_time > now
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReservationDirectory {
    reservations: Vec<Reservation>,
}

impl ReservationDirectory {
    pub fn insert(&mut self, reservation: Reservation) {
        self.reservations.push(reservation);
    }

    pub fn find(&self, name: &str) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.name == name)
    }

    /// Probe for a job that names its reservation. Returns the earliest
    /// usable start and the reservation's node mask.
    pub fn job_test_resv(
        &self,
        job: &JobRecord,
        now: i64,
    ) -> Result<(i64, NodeMask), SelectionError> {
        let name = job.resv_name.as_deref().unwrap_or_default();
        let Some(resv) = self.find(name) else {
            // Defunct reservation.
            return Err(SelectionError::InfeasibleConfig);
        };
        if resv.end_time <= now {
            return Err(SelectionError::ReservationNotUsable);
        }
        if !resv.admits(job) {
            // Access denied.
            return Err(SelectionError::InfeasibleConfig);
        }
        Ok((resv.start_time.max(now), resv.node_mask.clone()))
    }

    /// Probe for a job without a reservation: every node not claimed by a
    /// foreign reservation during `[now, horizon)`, together with nodes of
    /// reservations the job may use.
    pub fn probe_usable(&self, job: &JobRecord, now: i64, horizon: i64, width: usize) -> NodeMask {
        let mut usable = NodeMask::filled(width);
        for resv in &self.reservations {
            if resv.admits(job) {
                continue;
            }
            if resv.blocks_window(now, horizon) {
                usable.subtract(&resv.node_mask);
            }
        }
        usable
    }
}
