//! Supervision of the data-generation engine.
//!
//! Datagen drives a single engine that plays games against itself and
//! writes a training-data file. Only aggregate win/loss/draw counts
//! come back on stdout; the pentanomial histogram is derived
//! arithmetically from those. A task that fails in any way must not
//! leave a partial `.binpack` behind.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;

use montytest_worker_core::error::{Result, WorkerError};

use crate::assets::ensure_book;
use crate::bench::verify_signature;
use crate::builder::setup_engine;
use crate::coordinator::{Run, TaskReport, TaskState, update_task_with_retry};
use crate::process;
use crate::task::{BASELINE_NPS, EXE_SUFFIX, WorkerEnv, tests_repo};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Whitespace token positions in a `finished games` progress line.
fn parse_finished_games(line: &str) -> Result<(u64, u64, u64)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let field = |idx: usize| -> Option<u64> { tokens.get(idx)?.parse().ok() };
    match (field(8), field(4), field(6)) {
        (Some(wins), Some(losses), Some(draws)) => Ok((wins, losses, draws)),
        _ => Err(WorkerError::run(format!(
            "failed to parse score line: {line}"
        ))),
    }
}

/// Reconstruct the middle pentanomial buckets from aggregate counts.
/// With `d = W - L`: `b1 = max(-d, 0)`, `b3 = max(d, 0)` and
/// `b2 = (W + L + D)/2 - |d|`, which keeps twice the pair count equal
/// to the game count.
fn derive_pentanomial(wins: u64, losses: u64, draws: u64) -> Result<(u64, u64, u64)> {
    let diff = wins as i64 - losses as i64;
    let b1 = (-diff).max(0) as u64;
    let b3 = diff.max(0) as u64;
    let b2 = (wins + losses + draws) as i64 / 2 - diff.abs();
    if b2 < 0 {
        return Err(WorkerError::run(format!(
            "inconsistent datagen result: {wins}W/{losses}L/{draws}D cannot form game pairs"
        )));
    }
    Ok((b1, b2 as u64, b3))
}

async fn parse_datagen_output(
    child: &mut Child,
    lines: &mut mpsc::UnboundedReceiver<String>,
    tc_factor: f64,
    report: &mut TaskReport,
) -> Result<()> {
    let saved = report.stats.clone();

    // A factor of two over the nominal generation time absorbs variance.
    let tc_limit = tc_factor * 1800.0 * 2.0;
    let deadline = Instant::now() + Duration::from_secs_f64(tc_limit.clamp(0.0, 86_400.0 * 30.0));
    info!("tc limit {tc_limit:.2}s for data generation");

    let mut wld: Option<(u64, u64, u64)> = None;
    loop {
        if Instant::now() >= deadline {
            return Err(WorkerError::run(format!(
                "datagen past end time after {tc_limit:.2}s"
            )));
        }
        match lines.try_recv() {
            Ok(line) => {
                let line = line.trim();
                println!("{line}");
                if line.contains("finished games") {
                    wld = Some(parse_finished_games(line)?);
                }
            }
            Err(_) => {
                let exited = child
                    .try_wait()
                    .map_err(|err| WorkerError::run(format!("lost track of datagen: {err}")))?
                    .is_some();
                if exited {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

    let Some((wins, losses, draws)) = wld else {
        return Err(WorkerError::run(
            "datagen produced no 'finished games' line",
        ));
    };

    report.stats.wins = saved.wins + wins;
    report.stats.losses = saved.losses + losses;
    report.stats.draws = saved.draws + draws;

    let (b1, b2, b3) =
        derive_pentanomial(report.stats.wins, report.stats.losses, report.stats.draws)?;
    report.stats.pentanomial[1] = b1;
    report.stats.pentanomial[2] = b2;
    report.stats.pentanomial[3] = b3;

    Ok(())
}

fn remove_data_file(path: &Path) {
    if path.exists() {
        info!("removing {}", path.display());
        let _ = std::fs::remove_file(path);
    }
}

/// Build the datagen engine, run it for `games` games, and post the
/// final aggregate statistics.
pub async fn run_datagen(
    env: &WorkerEnv,
    run: &Run,
    games: u64,
    report: &mut TaskReport,
    state: &mut TaskState,
) -> Result<()> {
    let args = &run.args;
    let engine_name = format!("monty_datagen_{}", args.resolved_new);
    let engine = env.testing_dir.join(&engine_name);
    let engine_exe = env.testing_dir.join(format!("{engine_name}{EXE_SUFFIX}"));

    if !engine_exe.exists() {
        setup_engine(env, &engine, &args.resolved_new, tests_repo(args), true).await?;
    }

    ensure_book(&env.http, &env.testing_dir, &args.book).await?;

    // Datagen builds carry the base revision's search, so its signature
    // is the one to check.
    let nps = verify_signature(&engine_exe, args.base_signature, env.concurrency).await?;
    let tc_factor = BASELINE_NPS / (nps / 4.0);
    report.worker_info.nps = nps;

    let data_name = format!("data-{}.binpack", env.worker_info.unique_key);
    let data_file = env.testing_dir.join(&data_name);
    state.games_file = Some(data_file.clone());
    remove_data_file(&data_file);

    let nodes = args
        .nodes
        .ok_or_else(|| WorkerError::run("datagen run without a node limit"))?;

    let mut command = process::supervised_command(&engine_exe);
    command
        .arg("-o")
        .arg(&data_name)
        .arg("-n")
        .arg(nodes.to_string())
        .arg("-t")
        .arg(env.concurrency.to_string())
        .arg("-g")
        .arg(games.to_string())
        .current_dir(&env.testing_dir);
    if args.book.ends_with(".epd") {
        command.arg("-b").arg(&args.book);
    }

    let mut child = command
        .spawn()
        .map_err(|err| WorkerError::run(format!("unable to start datagen: {err}")))?;
    let mut lines = process::pump_lines(&mut child);

    let outcome = parse_datagen_output(&mut child, &mut lines, tc_factor, report).await;
    let status = process::shutdown_child(&mut child).await;

    match outcome {
        Err(err) => {
            remove_data_file(&data_file);
            Err(err)
        }
        Ok(()) => match status {
            Some(status) if status.success() => {
                if update_task_with_retry(&env.http, &env.remote, report).await? {
                    state.last_updated = Some(Utc::now());
                }
                Ok(())
            }
            Some(status) => {
                remove_data_file(&data_file);
                Err(WorkerError::run(format!(
                    "datagen process exited with non-zero return code: {status}"
                )))
            }
            None => {
                remove_data_file(&data_file);
                Err(WorkerError::run("datagen process had to be killed"))
            }
        },
    }
}
