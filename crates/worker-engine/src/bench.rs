//! Bench signature verification and throughput probing.
//!
//! `monty bench` searches a fixed position set and prints a
//! deterministic signature plus its speed. Running one bench per
//! allotted core both proves the built engine is the revision the test
//! asked for and measures the nodes-per-second used to scale the time
//! control to this machine.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::Command;
use tokio::task::JoinSet;

use montytest_worker_core::error::{Result, WorkerError};

/// Bench output below this is grounds for rejecting the host outright;
/// the fleet has no use for machines that cannot finish games in time.
pub fn required_nps(cores: usize) -> f64 {
    61362.0 / (1.0 + ((cores as f64 - 1.0) / 8.0).tanh())
}

fn engine_name(engine: &Path) -> String {
    engine
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| engine.display().to_string())
}

/// Run `<engine> bench` once and parse the last `Bench:` line into
/// `(signature, nps)`.
async fn run_single_bench(engine: PathBuf) -> Result<(u64, f64)> {
    let mut cmd = Command::new(&engine);
    cmd.arg("bench")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|err| WorkerError::run(format!("unable to start bench of {}: {err}", engine_name(&engine))))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| WorkerError::run("bench child has no stdout"))?;

    let mut parsed = None;
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|err| WorkerError::run(format!("unable to read bench output: {err}")))?
    {
        if !line.contains("Bench: ") {
            continue;
        }
        let fields: Vec<&str> = line.split(' ').collect();
        let signature = fields.get(1).and_then(|f| f.trim().parse::<u64>().ok());
        let nps = fields.get(3).and_then(|f| f.trim().parse::<f64>().ok());
        match (signature, nps) {
            (Some(signature), Some(nps)) => parsed = Some((signature, nps)),
            _ => {
                return Err(WorkerError::run(format!(
                    "unable to parse bench output of {}. Error occurred while processing line: '{line}'",
                    engine_name(&engine)
                )));
            }
        }
    }
    let _ = child.wait().await;

    parsed.ok_or_else(|| {
        WorkerError::run(format!(
            "unable to parse bench output of {}: no 'Bench:' line",
            engine_name(&engine)
        ))
    })
}

/// Fan the bench out over `active_cores` concurrent children. Every
/// signature must match `expected`; the result is the mean NPS.
pub async fn verify_signature(engine: &Path, expected: u64, active_cores: usize) -> Result<f64> {
    let active_cores = active_cores.max(1);
    let mut benches = JoinSet::new();
    for _ in 0..active_cores {
        benches.spawn(run_single_bench(engine.to_path_buf()));
    }

    let mut total_nps = 0.0;
    while let Some(joined) = benches.join_next().await {
        let (signature, nps) =
            joined.map_err(|err| WorkerError::run(format!("bench task failed: {err}")))??;
        if signature != expected {
            return Err(WorkerError::run(format!(
                "wrong bench in {}, user expected: {expected} but worker got: {signature}",
                engine_name(engine)
            )));
        }
        total_nps += nps;
    }

    Ok(total_nps / active_cores as f64)
}
