//! Argument parsing and validation for the `nodesel` binary.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "nodesel",
    about = "Run the node-selection engine over a cluster snapshot",
    disable_help_subcommand = true
)]
pub struct Args {
    /// Cluster snapshot (JSON).
    #[arg(long, value_name = "FILE")]
    pub snapshot: PathBuf,

    /// Consider only these job ids, in the given order (repeatable).
    /// Default: every pending job in priority order.
    #[arg(long = "job", value_name = "ID")]
    pub jobs: Vec<u32>,

    /// Feasibility answers only; no allocation state is changed.
    #[arg(long)]
    pub test_only: bool,

    /// Directory the decision report is written to.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub out: PathBuf,

    /// Suppress the per-job summary lines.
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Debug)]
pub enum CliError {
    MissingSnapshot(PathBuf),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::MissingSnapshot(path) => {
                write!(f, "snapshot file not found: {}", path.display())
            }
        }
    }
}

pub fn parse_and_validate() -> Result<Args, CliError> {
    let args = Args::parse();
    if !args.snapshot.is_file() {
        return Err(CliError::MissingSnapshot(args.snapshot));
    }
    Ok(args)
}
