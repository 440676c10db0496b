use std::path::PathBuf;

use clap::Parser;

const DEFAULT_REMOTE: &str = "https://tests.montychess.org";

fn default_concurrency() -> usize {
    // Leave one core for the match runner and the OS.
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

#[derive(Debug, Clone, Parser)]
#[command(name = "montytest-worker", version, about = "Monty regression-testing worker")]
pub struct Cli {
    /// Coordinator base URL.
    #[arg(long, env = "MONTYTEST_REMOTE", default_value = DEFAULT_REMOTE)]
    pub remote: String,

    /// Account the played games are credited to.
    #[arg(long, env = "MONTYTEST_USERNAME")]
    pub username: String,

    #[arg(long, env = "MONTYTEST_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Number of engine threads this worker may occupy.
    #[arg(long, env = "MONTYTEST_CONCURRENCY", default_value_t = default_concurrency())]
    pub concurrency: usize,

    /// Blob cache directory shared with other workers; omit to disable
    /// caching.
    #[arg(long, env = "MONTYTEST_GLOBAL_CACHE")]
    pub global_cache: Option<PathBuf>,

    /// Delete all previously built engine binaries before the first
    /// task.
    #[arg(long)]
    pub clear_binaries: bool,

    /// Directory holding the testing tree and the api log.
    #[arg(long, default_value = ".")]
    pub worker_dir: PathBuf,
}
