//! The task controller.
//!
//! Takes one task descriptor and sees it through: provision both engine
//! revisions and the opening book, verify bench signatures, derive the
//! CPU scaling factor, and then loop over match-runner invocations
//! until the task's games are played or the coordinator cancels it.

use std::path::{Path, PathBuf};

use sha1::{Digest as _, Sha1};
use tracing::{info, warn};

use montytest_worker_core::cache::ObjectCache;
use montytest_worker_core::error::{Result, WorkerError};

use crate::assets::ensure_book;
use crate::bench::{required_nps, verify_signature};
use crate::builder::setup_engine;
use crate::coordinator::{Run, RunArgs, TaskReport, TaskState, WorkerInfo};
use crate::datagen::run_datagen;
use crate::fastchess::{MatchPlan, SPSA_SENTINEL, launch_fastchess};
use crate::tc::adjust_tc;

/// Bench speed of the reference machine the time controls are tuned
/// for (32 processes on a Ryzen 9 7950X); the coordinator uses the same
/// value.
pub(crate) const BASELINE_NPS: f64 = 198243.0;

pub(crate) const EXE_SUFFIX: &str = if cfg!(windows) { ".exe" } else { "" };

const DEFAULT_TESTS_REPO: &str = "https://github.com/official-monty/monty";

const ENGINE_BACKUPS: usize = 50;
const NET_BACKUPS: usize = 10;

/// Long-lived worker configuration shared by every task.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub http: reqwest::Client,
    pub remote: String,
    pub password: String,
    pub worker_dir: PathBuf,
    pub testing_dir: PathBuf,
    pub cache: ObjectCache,
    pub concurrency: usize,
    pub clear_binaries: bool,
    pub worker_info: WorkerInfo,
}

pub(crate) fn tests_repo(args: &RunArgs) -> &str {
    args.tests_repo.as_deref().unwrap_or(DEFAULT_TESTS_REPO)
}

/// Opening selection seed: the low 64 bits of SHA-1 of the run id, so
/// every worker on a run draws from the same shuffled book order.
fn opening_seed(run_id: &str) -> u64 {
    let digest = Sha1::digest(run_id.as_bytes());
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[12..20]);
    u64::from_be_bytes(low)
}

/// Expand an option string like `"Hash=16 Threads=4"` into
/// `option.<name>=<value>` tokens. Values run up to the next word that
/// starts a new `name=`, so multi-word names survive.
pub(crate) fn parse_options(options: &str) -> Vec<String> {
    let chunks: Vec<&str> = options.split('=').collect();
    let mut results = Vec::new();
    let mut param = chunks[0].to_string();
    for chunk in &chunks[1..] {
        let words: Vec<&str> = chunk.split_whitespace().collect();
        let Some(value) = words.first() else {
            continue;
        };
        results.push(format!("option.{param}={value}"));
        param = words[1..].join(" ");
    }
    results
}

/// Remove all but the `keep` most recently modified files matching the
/// filter. Failures are logged and ignored; stale binaries are an
/// inconvenience, not an error.
fn prune_old_files(dir: &Path, keep: usize, matches: impl Fn(&str) -> bool) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !matches(&name) {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((entry.path(), modified))
        })
        .collect();
    files.sort_by(|a, b| b.1.cmp(&a.1));
    for (path, _) in files.into_iter().skip(keep) {
        if let Err(err) = std::fs::remove_file(&path) {
            warn!("failed to remove {}: {err}", path.display());
        }
    }
}

/// Execute one task to completion (or cooperative cancellation).
pub async fn run_task(env: &WorkerEnv, run: &Run, task_id: u64) -> Result<TaskState> {
    let args = &run.args;
    let task = &run.my_task;
    let mut state = TaskState::default();

    let input_stats = task.stats.clone().unwrap_or_default();
    if !input_stats.is_consistent() {
        return Err(WorkerError::run(format!(
            "resumed task carries inconsistent stats: {} pentanomial pairs vs {} games",
            input_stats.pentanomial_pairs(),
            input_stats.total_games()
        )));
    }
    let input_total = input_stats.total_games();

    let mut report = TaskReport {
        password: env.password.clone(),
        run_id: run.id.clone(),
        task_id,
        stats: input_stats,
        worker_info: env.worker_info.clone(),
        spsa: None,
    };

    let games_remaining = task
        .num_games
        .checked_sub(input_total)
        .filter(|remaining| *remaining > 0)
        .ok_or_else(|| {
            WorkerError::run(format!(
                "task has no games left: {input_total} of {} already played",
                task.num_games
            ))
        })?;

    if args.datagen {
        run_datagen(env, run, games_remaining, &mut report, &mut state).await?;
        return Ok(state);
    }

    if games_remaining % 2 != 0 {
        return Err(WorkerError::run(format!(
            "remaining game count {games_remaining} is odd"
        )));
    }

    let threads = args.threads.max(1) as usize;
    let spsa_tuning = args.spsa.is_some();
    let games_concurrency = env.concurrency / threads;
    if games_concurrency == 0 {
        return Err(WorkerError::run(format!(
            "{threads} threads per engine exceed the {} cores of this worker",
            env.concurrency
        )));
    }

    let opening_offset = task.start.unwrap_or(task_id * task.num_games);
    if task.start.is_some() {
        info!("variable task sizes used, opening offset = {opening_offset}");
    }
    let mut start_game_index = opening_offset + input_total;
    let run_seed = opening_seed(&run.id);

    let new_options = parse_options(&args.new_options);
    let base_options = parse_options(&args.base_options);

    let engine_backups = if env.clear_binaries { 0 } else { ENGINE_BACKUPS };
    prune_old_files(&env.testing_dir, engine_backups, |name| {
        name.starts_with("monty_") && name.ends_with(EXE_SUFFIX)
    });

    let new_engine_name = format!("monty_{}", args.resolved_new);
    let base_engine_name = format!("monty_{}", args.resolved_base);
    let new_engine = env.testing_dir.join(&new_engine_name);
    let base_engine = env.testing_dir.join(&base_engine_name);
    let new_engine_exe = env.testing_dir.join(format!("{new_engine_name}{EXE_SUFFIX}"));
    let base_engine_exe = env.testing_dir.join(format!("{base_engine_name}{EXE_SUFFIX}"));

    if !new_engine_exe.exists() {
        setup_engine(env, &new_engine, &args.resolved_new, tests_repo(args), false).await?;
    }
    if !base_engine_exe.exists() {
        setup_engine(env, &base_engine, &args.resolved_base, tests_repo(args), false).await?;
    }

    ensure_book(&env.http, &env.testing_dir, &args.book).await?;

    prune_old_files(&env.testing_dir, NET_BACKUPS, |name| {
        name.starts_with("nn-") && name.ends_with(".network")
    });

    let games_name = format!("results-{}.pgn", env.worker_info.unique_key);
    let games_file = env.testing_dir.join(&games_name);
    state.games_file = Some(games_file.clone());
    if let Err(err) = std::fs::remove_file(&games_file) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {err}", games_file.display());
        }
    }

    // Verify both engines; collect signature mismatches so a wrong pair
    // is reported in one go, but let anything worse out immediately.
    let mut run_errors: Vec<String> = Vec::new();
    let mut base_nps = 0.0;
    match verify_signature(&base_engine_exe, args.base_signature, games_concurrency * threads).await
    {
        Ok(nps) => base_nps = nps,
        Err(err @ WorkerError::Run(_)) => run_errors.push(err.message().to_string()),
        Err(err) => return Err(err),
    }
    if !(args.base_signature == args.new_signature && new_engine == base_engine) {
        match verify_signature(&new_engine_exe, args.new_signature, games_concurrency * threads)
            .await
        {
            Ok(_) => {}
            Err(err @ WorkerError::Run(_)) => run_errors.push(err.message().to_string()),
            Err(err) => return Err(err),
        }
    }
    if !run_errors.is_empty() {
        return Err(WorkerError::run(run_errors.join("\n")));
    }

    if base_nps < required_nps(env.concurrency) {
        return Err(WorkerError::fatal(format!(
            "this machine is too slow ({base_nps:.0} nps / thread) to run montytest effectively - sorry!"
        )));
    }

    let factor = BASELINE_NPS / base_nps;

    // The LTC reference limit anchors the batch-size heuristic.
    let (_, tc_limit_ltc) = adjust_tc("60+0.6", factor)?;
    let (scaled_tc, mut tc_limit) = adjust_tc(&args.tc, factor)?;
    let mut scaled_new_tc = scaled_tc.clone();
    if let Some(new_tc) = &args.new_tc {
        let (scaled, new_limit) = adjust_tc(new_tc, factor)?;
        scaled_new_tc = scaled;
        tc_limit = (tc_limit + new_limit) / 2.0;
    }

    report.worker_info.nps = base_nps;

    let mut threads_cmd: Vec<String> = Vec::new();
    if !new_options
        .iter()
        .chain(&base_options)
        .any(|opt| opt.contains("Threads"))
    {
        threads_cmd.push(format!("option.Threads={threads}"));
    }

    // nodestime runs the clock on node counts; extra grace time makes
    // real time losses virtually impossible.
    let mut nodestime_cmd: Vec<String> = Vec::new();
    if new_options
        .iter()
        .chain(&base_options)
        .any(|opt| opt.contains("nodestime"))
    {
        nodestime_cmd.push("timemargin=10000".to_string());
    }

    let new_player = args.new_tag.split(' ').next().unwrap_or(&args.new_tag);
    let base_player = args.base_tag.split(' ').next().unwrap_or(&args.base_tag);

    if spsa_tuning {
        tc_limit *= 2.0;
    }

    let mut games_remaining = games_remaining;
    while games_remaining > 0 {
        // Update frequency: every 4 games per slot at LTC, or a similar
        // wall-clock interval at shorter controls.
        let mut batch_size =
            games_concurrency as u64 * 4 * ((tc_limit_ltc / tc_limit).round() as u64).max(1);

        let (games_to_play, pgnout): (u64, Vec<String>) = if spsa_tuning {
            (batch_size.min(games_remaining), Vec::new())
        } else {
            (
                games_remaining,
                vec!["-pgnout".to_string(), games_name.clone()],
            )
        };

        if let Some(sprt) = &args.sprt {
            batch_size = 2 * sprt.batch_size;
            if games_to_play % batch_size != 0 {
                return Err(WorkerError::run(format!(
                    "{games_to_play} games do not align with batches of {batch_size}"
                )));
            }
        }
        if batch_size % 2 != 0 || games_to_play % 2 != 0 {
            return Err(WorkerError::run(
                "games are played in pairs; counts must be even",
            ));
        }

        let mut pgn_cmd: Vec<String> = Vec::new();
        if args.book_depth > 0 {
            if args.book.ends_with(".pgn") || args.book.ends_with(".epd") {
                let plies = 2 * args.book_depth;
                pgn_cmd = vec![
                    "-openings".to_string(),
                    format!("file={}", args.book),
                    format!("format={}", &args.book[args.book.len() - 3..]),
                    "order=random".to_string(),
                    format!("plies={plies}"),
                    format!("start={}", 1 + start_game_index / 2),
                ];
            } else {
                return Err(WorkerError::run(format!(
                    "unsupported opening book {}",
                    args.book
                )));
            }
        }

        let book_upper = args.book.to_uppercase();
        let variant = if book_upper.contains("FRC") || book_upper.contains("960") {
            "fischerandom"
        } else {
            "standard"
        };

        let fastchess = env.testing_dir.join(format!("fastchess{EXE_SUFFIX}"));
        let mut cmd: Vec<String> = vec![
            fastchess.display().to_string(),
            "-recover".to_string(),
            "-repeat".to_string(),
            "-games".to_string(),
            "2".to_string(),
            "-rounds".to_string(),
            (games_to_play / 2).to_string(),
            "-tournament".to_string(),
            "gauntlet".to_string(),
            "-ratinginterval".to_string(),
            "1".to_string(),
            "-scoreinterval".to_string(),
            "1".to_string(),
            "-autosaveinterval".to_string(),
            "0".to_string(),
            "-report".to_string(),
            "penta=true".to_string(),
        ];
        cmd.extend(pgnout);
        cmd.push("-site".to_string());
        cmd.push(format!("https://tests.montychess.org/tests/view/{}", run.id));
        cmd.push("-event".to_string());
        cmd.push(format!("Batch {task_id}: {new_player} vs {base_player}"));
        cmd.push("-srand".to_string());
        cmd.push(run_seed.to_string());
        if args.adjudication {
            cmd.extend(
                [
                    "-resign",
                    "movecount=3",
                    "score=600",
                    "-draw",
                    "movenumber=34",
                    "movecount=8",
                    "score=20",
                ]
                .map(String::from),
            );
        }
        cmd.push("-variant".to_string());
        cmd.push(variant.to_string());
        cmd.push("-concurrency".to_string());
        cmd.push(games_concurrency.to_string());
        cmd.extend(pgn_cmd);
        cmd.extend([
            "-engine".to_string(),
            format!("name=New-{}", args.resolved_new),
            format!("tc={scaled_new_tc}"),
            format!("cmd=./{new_engine_name}"),
            "dir=.".to_string(),
        ]);
        cmd.extend(new_options.iter().cloned());
        cmd.push(SPSA_SENTINEL.to_string());
        cmd.extend([
            "-engine".to_string(),
            format!("name=Base-{}", args.resolved_base),
            format!("tc={scaled_tc}"),
            format!("cmd=./{base_engine_name}"),
            "dir=.".to_string(),
        ]);
        cmd.extend(base_options.iter().cloned());
        cmd.push(SPSA_SENTINEL.to_string());
        cmd.push("-each".to_string());
        cmd.push("proto=uci".to_string());
        cmd.extend(nodestime_cmd.iter().cloned());
        cmd.extend(threads_cmd.iter().cloned());

        let plan = MatchPlan {
            games_to_play,
            batch_size,
            tc_limit: tc_limit * f64::max(8.0, games_to_play as f64 / games_concurrency as f64),
            spsa_tuning,
        };

        let task_alive = launch_fastchess(
            &env.http,
            &env.remote,
            &env.testing_dir,
            cmd,
            &mut report,
            &plan,
            &mut state,
        )
        .await?;

        games_remaining -= games_to_play;
        start_game_index += games_to_play;

        if !task_alive {
            break;
        }
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_strings_expand_positionally() {
        assert_eq!(
            parse_options("Hash=16 Threads=4"),
            vec!["option.Hash=16", "option.Threads=4"]
        );
        assert_eq!(
            parse_options("Move Overhead=100 Hash=8"),
            vec!["option.Move Overhead=100", "option.Hash=8"]
        );
        assert!(parse_options("").is_empty());
        assert!(parse_options("NoValueHere").is_empty());
    }

    #[test]
    fn opening_seed_takes_the_low_64_bits_of_sha1() {
        // sha1("64f1e2abc") = 3f371ca601a4d6945113c862d5936df5f76f122b
        assert_eq!(opening_seed("64f1e2abc"), 15_389_765_254_840_783_403);
        assert_eq!(opening_seed("64f1e2abc"), opening_seed("64f1e2abc"));
        assert_ne!(opening_seed("64f1e2abc"), opening_seed("64f1e2abd"));
    }

    #[test]
    fn pruning_keeps_the_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        let ages = [400u64, 300, 200, 100];
        for (idx, age) in ages.iter().enumerate() {
            let path = dir.path().join(format!("monty_rev{idx}"));
            let file = std::fs::File::create(&path).unwrap();
            let mtime = std::time::SystemTime::now() - std::time::Duration::from_secs(*age);
            file.set_modified(mtime).unwrap();
        }
        std::fs::write(dir.path().join("fastchess"), b"").unwrap();

        prune_old_files(dir.path(), 2, |name| name.starts_with("monty_"));

        let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["fastchess", "monty_rev2", "monty_rev3"]);
    }

    #[test]
    fn tests_repo_falls_back_to_the_official_repository() {
        let raw = serde_json::json!({
            "tc": "10+0.1",
            "book": "book.epd",
            "book_depth": 8,
            "threads": 1,
            "new_options": "",
            "base_options": "",
            "resolved_new": "a",
            "resolved_base": "b",
            "new_signature": 1,
            "base_signature": 1,
            "new_tag": "patch",
            "base_tag": "master",
        });
        let args: RunArgs = serde_json::from_value(raw).unwrap();
        assert_eq!(tests_repo(&args), "https://github.com/official-monty/monty");
    }
}
