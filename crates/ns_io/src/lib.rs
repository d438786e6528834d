//! ns_io — Snapshot I/O for the node-selection engine.
//!
//! The engine holds no persistent state of its own; it is repopulated from
//! caller-provided snapshots. This crate owns:
//!
//! - the serde model of a cluster snapshot (`snapshot`),
//! - the loader that cross-links names into registry indices and builds a
//!   `ClusterState` plus the job queue (`loader`),
//! - canonical JSON bytes (stable key order, LF-terminated) and SHA-256
//!   digests for reproducible decision reports (`canonical_json`,
//!   `hasher`).

pub mod canonical_json;
pub mod hasher;
pub mod loader;
pub mod snapshot;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("node `{node}` references unknown configuration `{config}`")]
    UnknownConfig { node: String, config: String },
    #[error("{owner} references unknown partition `{partition}`")]
    UnknownPartition { owner: String, partition: String },
    #[error("{owner} references unknown node `{node}`")]
    UnknownNode { owner: String, node: String },
    #[error("duplicate {kind} name `{name}`")]
    DuplicateName { kind: &'static str, name: String },
    #[error("job {job}: bad feature expression: {source}")]
    BadFeatures {
        job: u32,
        source: ns_core::FeatureParseError,
    },
}
