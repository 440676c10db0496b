//! Supervision of the fastchess tournament runner.
//!
//! fastchess interleaves game results, rating blocks and warnings on
//! its two stdio streams. The supervisor funnels both streams into one
//! queue and consumes it single-threaded: each WLD line and each
//! pentanomial line is captured independently, and when both captures
//! are present they are committed together against the statistics
//! baseline saved at entry. Committing against the saved baseline (not
//! the running totals) keeps partial batches idempotent: fastchess
//! reports cumulative numbers for the invocation, so re-deriving
//! `baseline + reported` is correct no matter how many blocks have been
//! seen.
//!
//! A capture survives unrelated lines until its counterpart arrives.
//! Blocks do not interleave in practice; if one ever arrives torn, the
//! stale half is paired with the next counterpart rather than being
//! re-scoped.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use regex::Regex;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;

use montytest_worker_core::error::{Result, WorkerError};

use crate::coordinator::{
    SpsaParam, SpsaState, TaskReport, TaskState, request_spsa, update_task_with_retry,
};
use crate::process;

/// Placeholder token in the command vector marking where an engine's
/// per-batch option list goes (first occurrence: new engine, second:
/// base engine).
pub const SPSA_SENTINEL: &str = "_spsa_";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

static HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(Base|New)-([a-f0-9]+)").expect("hash pattern"));

// Captures from a block like:
//   Games: 680, Wins: 248, Losses: 266, Draws: 166, Points: 331.0 (48.68 %)
//   Ptnml(0-2): [43, 61, 144, 55, 37], WL/DD Ratio: 4.76
static WLD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Games: ([0-9]+), Wins: ([0-9]+), Losses: ([0-9]+), Draws: ([0-9]+), Points: ([0-9.]+) \(",
    )
    .expect("wld pattern")
});
static PTNML_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Ptnml\(0-2\): \[([0-9]+), ([0-9]+), ([0-9]+), ([0-9]+), ([0-9]+)\]")
        .expect("pentanomial pattern")
});

#[derive(Debug, Clone, Copy)]
struct WldCapture {
    games: u64,
    wins: u64,
    losses: u64,
    draws: u64,
}

/// One fastchess invocation: how many games it plays, where the commit
/// boundaries are, and how long it may run.
#[derive(Debug, Clone)]
pub struct MatchPlan {
    pub games_to_play: u64,
    pub batch_size: u64,
    /// Wall-clock budget for the whole invocation, in seconds.
    pub tc_limit: f64,
    pub spsa_tuning: bool,
}

/// Round a tuning value to an integer stochastically: `x` becomes
/// `floor(x) + 1` with probability `frac(x)`, so the expectation stays
/// `x`.
pub(crate) fn stochastic_round(value: f64, rng: &mut impl Rng) -> i64 {
    (value + rng.gen_range(0.0..1.0)).floor() as i64
}

fn option_token(param: &SpsaParam, rng: &mut impl Rng) -> String {
    format!("option.{}={}", param.name, stochastic_round(param.value, rng))
}

/// Replace the two sentinels with the per-engine option lists (empty
/// lists just remove them).
fn splice_spsa(cmd: Vec<String>, w_params: &[SpsaParam], b_params: &[SpsaParam]) -> Result<Vec<String>> {
    let mut rng = rand::thread_rng();
    let mut spliced = Vec::with_capacity(cmd.len() + w_params.len() + b_params.len());
    let mut fills = [w_params, b_params].into_iter();
    for token in cmd {
        if token == SPSA_SENTINEL {
            let params = fills.next().ok_or_else(|| {
                WorkerError::run("unexpected extra engine option placeholder in command")
            })?;
            spliced.extend(params.iter().map(|p| option_token(p, &mut rng)));
        } else {
            spliced.push(token);
        }
    }
    if fills.next().is_some() {
        return Err(WorkerError::run(
            "engine option placeholder missing from command",
        ));
    }
    Ok(spliced)
}

fn shorten_hashes(line: &str) -> String {
    HASH_RE
        .replace_all(line, |caps: &regex::Captures<'_>| {
            let hash = &caps[2];
            format!("{}-{}", &caps[1], &hash[..hash.len().min(10)])
        })
        .into_owned()
}

fn parse_wld(caps: &regex::Captures<'_>, line: &str) -> Result<WldCapture> {
    let field = |idx: usize| -> Result<u64> {
        caps[idx]
            .parse()
            .map_err(|err| WorkerError::run(format!("failed to parse WLD line: {line}: {err}")))
    };
    Ok(WldCapture {
        games: field(1)?,
        wins: field(2)?,
        losses: field(3)?,
        draws: field(4)?,
    })
}

fn parse_ptnml(caps: &regex::Captures<'_>, line: &str) -> Result<[u64; 5]> {
    let mut buckets = [0u64; 5];
    for (slot, idx) in buckets.iter_mut().zip(1usize..=5) {
        *slot = caps[idx].parse().map_err(|err| {
            WorkerError::run(format!("failed to parse ptnml line: {line}: {err}"))
        })?;
    }
    Ok(buckets)
}

/// Run one fastchess invocation to completion, committing batch results
/// to the coordinator as they appear. Returns `false` when the
/// coordinator cancelled the task mid-stream.
pub async fn launch_fastchess(
    http: &reqwest::Client,
    remote: &str,
    cwd: &Path,
    cmd: Vec<String>,
    report: &mut TaskReport,
    plan: &MatchPlan,
    state: &mut TaskState,
) -> Result<bool> {
    let cmd = if plan.spsa_tuning {
        let reply = request_spsa(http, remote, report).await?;
        if let Some(error) = reply.error {
            return Err(WorkerError::run(error));
        }
        if !reply.task_alive {
            info!("the server told us that no more games are needed for the current task");
            return Ok(false);
        }
        report.spsa = Some(SpsaState {
            num_games: plan.games_to_play,
            wins: 0,
            losses: 0,
            draws: 0,
        });
        splice_spsa(cmd, &reply.w_params, &reply.b_params)?
    } else {
        splice_spsa(cmd, &[], &[])?
    };

    let (program, args) = cmd
        .split_first()
        .ok_or_else(|| WorkerError::run("empty fastchess command"))?;
    let mut command = process::supervised_command(program);
    command.args(args).current_dir(cwd);
    let mut child = command
        .spawn()
        .map_err(|err| WorkerError::run(format!("unable to start fastchess: {err}")))?;
    let mut lines = process::pump_lines(&mut child);

    let outcome = parse_fastchess_output(&mut child, &mut lines, http, remote, report, plan, state).await;

    process::shutdown_child(&mut child).await;
    outcome
}

async fn parse_fastchess_output(
    child: &mut Child,
    lines: &mut mpsc::UnboundedReceiver<String>,
    http: &reqwest::Client,
    remote: &str,
    report: &mut TaskReport,
    plan: &MatchPlan,
    state: &mut TaskState,
) -> Result<bool> {
    let saved = report.stats.clone();
    let mut wld: Option<WldCapture> = None;
    let mut ptnml: Option<[u64; 5]> = None;
    let mut games_updated: u64 = 0;

    let budget = Duration::from_secs_f64(plan.tc_limit.clamp(0.0, 86_400.0 * 30.0));
    let deadline = Instant::now() + budget;
    info!("tc limit {:.2}s for {} games", plan.tc_limit, plan.games_to_play);

    while Instant::now() < deadline {
        let line = match lines.try_recv() {
            Ok(line) => line,
            Err(_) => {
                let exited = child
                    .try_wait()
                    .map_err(|err| WorkerError::run(format!("lost track of fastchess: {err}")))?
                    .is_some();
                if exited {
                    return Ok(true);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        let line = shorten_hashes(line.trim());
        println!("{line}");

        if line.contains("Finished match") {
            if games_updated == plan.games_to_play {
                info!("finished match cleanly");
            } else {
                return Err(WorkerError::run(format!(
                    "finished match uncleanly {games_updated} vs. required {}",
                    plan.games_to_play
                )));
            }
        }

        // e.g. Warning: New-abc doesn't have option ThreatBySafePawn
        //      Warning: Invalid value for option P: -354
        if line.contains("Warning:")
            && (line.contains("doesn't have option") || line.contains("Invalid value"))
        {
            return Err(WorkerError::run(format!("fastchess says: \"{line}\"")));
        }

        // e.g. Finished game 1 (monty vs base): 0-1 {White disconnects}
        if line.contains("disconnects") || line.contains("connection stalls") {
            report.stats.crashes += 1;
        }
        if line.contains("on time") {
            report.stats.time_losses += 1;
        }

        if let Some(caps) = WLD_RE.captures(&line) {
            wld = Some(parse_wld(&caps, &line)?);
        }
        if let Some(caps) = PTNML_RE.captures(&line) {
            ptnml = Some(parse_ptnml(&caps, &line)?);
        }

        let (Some(batch_wld), Some(batch_ptnml)) = (wld, ptnml) else {
            continue;
        };

        // Both halves of the block are in: fold them onto the baseline.
        for (slot, (base, add)) in report
            .stats
            .pentanomial
            .iter_mut()
            .zip(saved.pentanomial.iter().zip(batch_ptnml.iter()))
        {
            *slot = base + add;
        }
        report.stats.wins = saved.wins + batch_wld.wins;
        report.stats.losses = saved.losses + batch_wld.losses;
        report.stats.draws = saved.draws + batch_wld.draws;

        if plan.spsa_tuning {
            if let Some(spsa) = report.spsa.as_mut() {
                spsa.wins = batch_wld.wins;
                spsa.losses = batch_wld.losses;
                spsa.draws = batch_wld.draws;
            }
        }

        let games_finished = batch_wld.games;
        let batch_pairs: u64 = batch_ptnml.iter().sum();

        if !report.stats.is_consistent() {
            return Err(WorkerError::run(format!(
                "inconsistent stats: pentanomial pairs {} vs games {}",
                report.stats.pentanomial_pairs(),
                report.stats.total_games()
            )));
        }
        if games_finished != 2 * batch_pairs {
            return Err(WorkerError::run(format!(
                "game count {games_finished} does not match {batch_pairs} pentanomial pairs"
            )));
        }
        if games_finished > games_updated + plan.batch_size {
            return Err(WorkerError::run(format!(
                "game count {games_finished} overshoots the batch boundary {}",
                games_updated + plan.batch_size
            )));
        }
        if games_finished > plan.games_to_play {
            return Err(WorkerError::run(format!(
                "game count {games_finished} exceeds the {} games of this invocation",
                plan.games_to_play
            )));
        }

        wld = None;
        ptnml = None;

        // Send an update after a full batch or once all games are in.
        if games_finished == games_updated + plan.batch_size
            || games_finished == plan.games_to_play
        {
            if !update_task_with_retry(http, remote, report).await? {
                return Ok(false);
            }
            games_updated = games_finished;
            state.last_updated = Some(Utc::now());
        }
    }

    Err(WorkerError::run(format!(
        "match runner past end time after {:.2}s",
        plan.tc_limit
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_shortened_to_ten_characters() {
        let line = "Results of New-e443b2459e1a22b9 vs Base-e443b2459e1a22b9 (0.601+0.006)";
        assert_eq!(
            shorten_hashes(line),
            "Results of New-e443b2459e vs Base-e443b2459e (0.601+0.006)"
        );
        // Short hashes survive unchanged.
        assert_eq!(shorten_hashes("New-ab12"), "New-ab12");
        assert_eq!(shorten_hashes("no hashes here"), "no hashes here");
    }

    #[test]
    fn wld_and_ptnml_lines_are_captured() {
        let wld_line = "Games: 680, Wins: 248, Losses: 266, Draws: 166, Points: 331.0 (48.68 %)";
        let caps = WLD_RE.captures(wld_line).unwrap();
        let wld = parse_wld(&caps, wld_line).unwrap();
        assert_eq!(
            (wld.games, wld.wins, wld.losses, wld.draws),
            (680, 248, 266, 166)
        );

        let ptnml_line = "Ptnml(0-2): [43, 61, 144, 55, 37], WL/DD Ratio: 4.76";
        let caps = PTNML_RE.captures(ptnml_line).unwrap();
        assert_eq!(parse_ptnml(&caps, ptnml_line).unwrap(), [43, 61, 144, 55, 37]);

        assert!(WLD_RE.captures("Games: 10, Wins: 5").is_none());
    }

    #[test]
    fn stochastic_rounding_stays_in_range_and_on_average_on_value() {
        let mut rng = rand::thread_rng();
        let value = 3.4;
        let mut sum = 0.0;
        for _ in 0..4000 {
            let rounded = stochastic_round(value, &mut rng);
            assert!(rounded == 3 || rounded == 4, "{rounded}");
            sum += rounded as f64;
        }
        let mean = sum / 4000.0;
        assert!((mean - value).abs() < 0.1, "mean {mean}");

        for _ in 0..100 {
            assert_eq!(stochastic_round(-2.0, &mut rng), -2);
        }
    }

    #[test]
    fn splice_removes_sentinels_without_params() {
        let cmd = vec![
            "fastchess".to_string(),
            "-engine".to_string(),
            SPSA_SENTINEL.to_string(),
            "-engine".to_string(),
            SPSA_SENTINEL.to_string(),
        ];
        let spliced = splice_spsa(cmd, &[], &[]).unwrap();
        assert_eq!(spliced, vec!["fastchess", "-engine", "-engine"]);
    }

    #[test]
    fn splice_inserts_rounded_options_in_position() {
        let cmd = vec![
            "fastchess".to_string(),
            SPSA_SENTINEL.to_string(),
            "-mid".to_string(),
            SPSA_SENTINEL.to_string(),
        ];
        let w = vec![SpsaParam { name: "P".into(), value: 3.4 }];
        let b = vec![SpsaParam { name: "Q".into(), value: 7.0 }];
        let spliced = splice_spsa(cmd, &w, &b).unwrap();
        assert_eq!(spliced.len(), 4);
        assert!(spliced[1] == "option.P=3" || spliced[1] == "option.P=4", "{}", spliced[1]);
        assert_eq!(spliced[2], "-mid");
        assert_eq!(spliced[3], "option.Q=7");
    }

    #[test]
    fn splice_requires_both_sentinels() {
        let missing = vec!["fastchess".to_string(), SPSA_SENTINEL.to_string()];
        assert!(splice_spsa(missing, &[], &[]).is_err());
        let extra = vec![
            SPSA_SENTINEL.to_string(),
            SPSA_SENTINEL.to_string(),
            SPSA_SENTINEL.to_string(),
        ];
        assert!(splice_spsa(extra, &[], &[]).is_err());
    }
}
