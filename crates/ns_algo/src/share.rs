//! Node-sharing resolution.
//!
//! Decides whether a job may share nodes with other jobs, from three
//! inputs: what the submitter asked for, the partition policy, and whether
//! the placement oracle runs with consumable resources (CR).
//!
//! Decision table (rows: partition policy; columns: user request):
//!
//! ```text
//! partition \ user   default      exclusive    share=yes
//! EXCLUSIVE          no-share     no-share     no-share
//! NO,  no CR         no-share     no-share     user-share
//! NO,  CR            no-share     no-share     forced-share
//! YES, no CR         no-share     no-share     user-share
//! YES, CR            forced       no-share     forced-share
//! FORCE              forced       forced       forced-share
//! ```
//!
//! `ForcedShare` differs from `UserShare` in that downstream placement may
//! overcommit resources.

use ns_core::{ShareMode, SharePolicy, ShareRequest};

pub fn resolve_share(request: ShareRequest, policy: SharePolicy, cons_res: bool) -> ShareMode {
    match policy {
        SharePolicy::Exclusive => ShareMode::NoShare,
        SharePolicy::Force(_) => ShareMode::ForcedShare,
        SharePolicy::No | SharePolicy::Yes(_) => match request {
            ShareRequest::Exclusive => ShareMode::NoShare,
            ShareRequest::Indifferent => {
                if cons_res && matches!(policy, SharePolicy::Yes(_)) {
                    ShareMode::ForcedShare
                } else {
                    ShareMode::NoShare
                }
            }
            ShareRequest::Shared => {
                if cons_res {
                    ShareMode::ForcedShare
                } else {
                    ShareMode::UserShare
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ShareMode::{ForcedShare, NoShare, UserShare};
    use SharePolicy::{Force, No, Yes};
    use ShareRequest::{Indifferent, Shared};

    /// The table above, cell for cell.
    fn table(request: ShareRequest, policy: SharePolicy, cons_res: bool) -> ShareMode {
        match (policy, cons_res, request) {
            (SharePolicy::Exclusive, _, _) => NoShare,
            (Force(_), _, _) => ForcedShare,
            (No, false, Shared) => UserShare,
            (No, true, Shared) => ForcedShare,
            (No, _, _) => NoShare,
            (Yes(_), false, Shared) => UserShare,
            (Yes(_), true, Shared) => ForcedShare,
            (Yes(_), true, Indifferent) => ForcedShare,
            (Yes(_), _, _) => NoShare,
        }
    }

    #[test]
    fn exclusive_partition_never_shares() {
        for request in [Indifferent, ShareRequest::Exclusive, Shared] {
            for cr in [false, true] {
                assert_eq!(resolve_share(request, SharePolicy::Exclusive, cr), NoShare);
            }
        }
    }

    #[test]
    fn force_partition_overrides_exclusive_request() {
        assert_eq!(
            resolve_share(ShareRequest::Exclusive, Force(4), false),
            ForcedShare,
            "partition FORCE wins over a user exclusive request"
        );
    }

    #[test]
    fn consumable_resources_upgrade_share_to_forced() {
        assert_eq!(resolve_share(Shared, No, false), UserShare);
        assert_eq!(resolve_share(Shared, No, true), ForcedShare);
        assert_eq!(resolve_share(Indifferent, Yes(2), true), ForcedShare);
        assert_eq!(resolve_share(Indifferent, Yes(2), false), NoShare);
    }

    proptest! {
        #[test]
        fn matches_decision_table(
            request in prop_oneof![
                Just(Indifferent),
                Just(ShareRequest::Exclusive),
                Just(Shared),
            ],
            policy in prop_oneof![
                Just(SharePolicy::Exclusive),
                Just(No),
                (2u16..16).prop_map(Yes),
                (2u16..16).prop_map(Force),
            ],
            cons_res in any::<bool>(),
        ) {
            prop_assert_eq!(
                resolve_share(request, policy, cons_res),
                table(request, policy, cons_res)
            );
        }
    }
}
