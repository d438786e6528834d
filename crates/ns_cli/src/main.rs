//! `nodesel` — drive the selection engine over a snapshot, offline and
//! deterministically: same snapshot in, byte-identical report out.

mod args;

use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::Path;
use std::process::ExitCode;

use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use args::{parse_and_validate, Args};
use ns_algo::LinearOracle;
use ns_core::JobId;
use ns_io::canonical_json::to_canonical_bytes;
use ns_io::hasher::sha256_hex;
use ns_io::loader::{self, LoadedSnapshot};
use ns_pipeline::{Controller, Reservation};

const REPORT_FILE: &str = "decisions.json";

#[derive(Serialize)]
struct Decision {
    job: u32,
    name: String,
    outcome: &'static str,
    nodes: Vec<String>,
    cpus: u32,
    preempted: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

#[derive(Serialize)]
struct AgentLine {
    message: &'static str,
    job: u32,
    hosts: Vec<String>,
}

#[derive(Serialize)]
struct Report {
    snapshot_digest: String,
    generated_at: i64,
    test_only: bool,
    decisions: Vec<Decision>,
    agent_requests: Vec<AgentLine>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(io::stderr)
        .init();

    let args = match parse_and_validate() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("nodesel: error: {e}");
            return ExitCode::from(1);
        }
    };
    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("nodesel: error: {e}");
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> Result<ExitCode, String> {
    let loaded = loader::load_path(&args.snapshot)
        .map_err(|e| format!("cannot load {}: {e}", args.snapshot.display()))?;
    let now = loaded.now;
    let digest = loaded.digest.clone();
    let mut ctl = build_controller(loaded);

    let queue = queue_order(&ctl, &args.jobs);
    debug!(jobs = queue.len(), "selection queue assembled");

    let mut decisions = Vec::with_capacity(queue.len());
    let mut any_permanent = false;
    for job_id in queue {
        let (name, priority) = ctl
            .jobs
            .get(job_id)
            .map(|j| (j.name.clone(), j.priority))
            .unwrap_or_default();
        let decision = match ctl.select_nodes(job_id, args.test_only, now) {
            Ok(success) => {
                if !args.quiet {
                    println!(
                        "job {job_id}: {} {} ({} cpus)",
                        if success.test_only { "feasible on" } else { "allocated" },
                        success.node_names.join(","),
                        success.cpu_count
                    );
                }
                Decision {
                    job: job_id.as_u32(),
                    name,
                    outcome: if success.test_only { "feasible" } else { "allocated" },
                    nodes: success.node_names,
                    cpus: success.cpu_count,
                    preempted: success.preempted.iter().map(|j| j.as_u32()).collect(),
                    error: None,
                    kind: None,
                }
            }
            Err(error) => {
                let kind = if error.is_permanent() {
                    any_permanent = true;
                    "permanent"
                } else {
                    "transient"
                };
                if !args.quiet {
                    println!("job {job_id} (prio {priority}): pending — {error} [{kind}]");
                }
                Decision {
                    job: job_id.as_u32(),
                    name,
                    outcome: "pending",
                    nodes: Vec::new(),
                    cpus: 0,
                    preempted: Vec::new(),
                    error: Some(error.to_string()),
                    kind: Some(kind),
                }
            }
        };
        decisions.push(decision);
    }

    let agent_requests = ctl
        .agent
        .iter()
        .map(|r| AgentLine {
            message: match r.message {
                ns_pipeline::AgentMessage::TerminateJob => "terminate_job",
                ns_pipeline::AgentMessage::KillTimelimit => "kill_timelimit",
                ns_pipeline::AgentMessage::KillPreempted => "kill_preempted",
            },
            job: r.job.as_u32(),
            hosts: r.hosts.clone(),
        })
        .collect();

    let report = Report {
        snapshot_digest: digest,
        generated_at: now,
        test_only: args.test_only,
        decisions,
        agent_requests,
    };
    let bytes =
        to_canonical_bytes(&report).map_err(|e| format!("cannot serialize report: {e}"))?;
    let report_digest = sha256_hex(&bytes);

    fs::create_dir_all(&args.out)
        .map_err(|e| format!("cannot create output directory {}: {e}", args.out.display()))?;
    let path = args.out.join(REPORT_FILE);
    write_atomically(&path, &bytes).map_err(|e| format!("cannot write {}: {e}", path.display()))?;

    if !args.quiet {
        println!("nodesel: report {} sha256:{report_digest}", path.display());
    }
    Ok(if any_permanent {
        ExitCode::from(2)
    } else {
        ExitCode::from(0)
    })
}

fn build_controller(loaded: LoadedSnapshot) -> Controller<LinearOracle> {
    let mut ctl = Controller::new(loaded.cluster, LinearOracle);
    for resv in loaded.reservations {
        ctl.reservations.insert(Reservation {
            name: resv.name,
            node_mask: resv.node_mask,
            start_time: resv.start_time,
            end_time: resv.end_time,
            users: resv.users,
        });
    }
    for job in loaded.jobs {
        ctl.jobs.insert(job);
    }
    ctl
}

/// Explicit ids run in the given order; otherwise every pending job in
/// descending priority (ties by id).
fn queue_order(ctl: &Controller<LinearOracle>, requested: &[u32]) -> Vec<JobId> {
    if !requested.is_empty() {
        return requested.iter().map(|id| JobId::new(*id)).collect();
    }
    let mut pending = ctl.jobs.pending_ids();
    pending.sort_by_key(|id| {
        let priority = ctl.jobs.get(*id).map(|j| j.priority).unwrap_or(0);
        (Reverse(priority), *id)
    });
    pending
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
