//! Registry indices.
//!
//! Every cross-record reference in the engine is one of these newtypes: a
//! stable index into the owning registry (`ClusterState::nodes`,
//! `ClusterState::configs`, ...). Indices are assigned at load time and
//! never reused within a run.

use core::fmt;

macro_rules! registry_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u32);

        impl $name {
            pub fn new(index: u32) -> Self {
                Self(index)
            }

            /// Position in the owning registry.
            pub fn index(self) -> usize {
                self.0 as usize
            }

            pub fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

registry_id!(
    /// Index into the node table. Doubles as the bit position of the node in
    /// every population mask.
    NodeId
);

registry_id!(
    /// Index into the configuration-record table.
    ConfigId
);

registry_id!(
    /// Index into the partition table.
    PartitionId
);

registry_id!(
    /// Controller-assigned job identifier.
    JobId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_ordered_by_index() {
        assert!(NodeId::new(3) < NodeId::new(17));
        assert_eq!(JobId::new(42).to_string(), "42");
        assert_eq!(ConfigId::new(7).index(), 7);
    }
}
