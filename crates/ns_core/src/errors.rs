//! Selection error taxonomy.
//!
//! Closed set, split into *permanent* kinds (retrying is pointless until
//! configuration changes) and *transient* kinds (retry next schedule
//! cycle). Callers branch on the kind; messages are for operators.

use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum SelectionError {
    // --- transient ---
    #[error("job violates an accounting policy limit")]
    AccountingPolicy,
    #[error("job is held")]
    JobHeld,
    #[error("partition is down or inactive")]
    PartitionDown,
    #[error("fair-share usage below QoS threshold")]
    QosThreshold,
    #[error("requested nodes are busy")]
    NodesBusy,

    // --- permanent ---
    #[error("requested partition configuration unavailable")]
    PartConfigUnavailable,
    #[error("node count outside partition limits")]
    PartNodeLimit,
    #[error("required node not available (down or drained)")]
    NodeNotAvail,
    #[error("reservation not usable")]
    ReservationNotUsable,
    #[error("feature constraints can never be satisfied")]
    InfeasibleFeatures,
    #[error("no configured nodes can ever satisfy the request")]
    InfeasibleConfig,
}

impl SelectionError {
    /// True when the request cannot succeed until the cluster configuration
    /// changes; the caller should stop retrying.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            SelectionError::PartConfigUnavailable
                | SelectionError::PartNodeLimit
                | SelectionError::NodeNotAvail
                | SelectionError::ReservationNotUsable
                | SelectionError::InfeasibleFeatures
                | SelectionError::InfeasibleConfig
        )
    }

    pub fn is_transient(self) -> bool {
        !self.is_permanent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_split_is_total() {
        let all = [
            SelectionError::AccountingPolicy,
            SelectionError::JobHeld,
            SelectionError::PartitionDown,
            SelectionError::QosThreshold,
            SelectionError::NodesBusy,
            SelectionError::PartConfigUnavailable,
            SelectionError::PartNodeLimit,
            SelectionError::NodeNotAvail,
            SelectionError::ReservationNotUsable,
            SelectionError::InfeasibleFeatures,
            SelectionError::InfeasibleConfig,
        ];
        for e in all {
            assert_ne!(e.is_permanent(), e.is_transient());
        }
    }
}
