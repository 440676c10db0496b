mod cli;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser as _;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use montytest_worker_core::apilog;
use montytest_worker_core::cache::ObjectCache;
use montytest_worker_engine::coordinator::{self, FailedTaskReport, TaskRequest};
use montytest_worker_engine::process;
use montytest_worker_engine::{WorkerEnv, WorkerInfo, run_task};

use crate::cli::Cli;
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};

const IDLE_SLEEP: Duration = Duration::from_secs(30);
const FAILURE_SLEEP: Duration = Duration::from_secs(30);

fn unique_key() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Pull one task and run it. Idle and failed cycles handle their own
/// back-off; only fatal errors propagate.
async fn run_one_cycle(env: &WorkerEnv) -> montytest_worker_core::error::Result<()> {
    let request = TaskRequest {
        password: env.password.clone(),
        worker_info: env.worker_info.clone(),
    };
    let reply = match coordinator::request_task(&env.http, &env.remote, &request).await {
        Ok(reply) => reply,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            warn!("unable to fetch a task: {err}");
            tokio::time::sleep(IDLE_SLEEP).await;
            return Ok(());
        }
    };
    if let Some(error) = reply.error {
        warn!("coordinator refused to hand out work: {error}");
        tokio::time::sleep(IDLE_SLEEP).await;
        return Ok(());
    }
    let (Some(run), Some(task_id)) = (reply.run, reply.task_id) else {
        info!("no tasks available right now");
        tokio::time::sleep(IDLE_SLEEP).await;
        return Ok(());
    };

    info!("running task {task_id} of run {}", run.id);
    match run_task(env, &run, task_id).await {
        Ok(state) => {
            match state.last_updated {
                Some(at) => info!("task {task_id} done, last update at {at}"),
                None => info!("task {task_id} done"),
            }
            Ok(())
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            error!("task {task_id} failed: {err}");
            let failure = FailedTaskReport {
                password: env.password.clone(),
                run_id: run.id.clone(),
                task_id,
                message: err.message().to_string(),
                worker_info: env.worker_info.clone(),
            };
            if let Err(report_err) = coordinator::failed_task(&env.http, &env.remote, &failure).await
            {
                warn!("unable to report the task failure: {report_err}");
            }
            tokio::time::sleep(FAILURE_SLEEP).await;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Windows Ctrl-C delivery runs through a console-less copy of this
    // binary; dispatch it before argument parsing.
    let raw_args: Vec<String> = std::env::args().collect();
    if raw_args.get(1).map(String::as_str) == Some(process::CTRL_C_HELPER_ARG) {
        let pid = raw_args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
        std::process::exit(process::run_ctrl_c_helper(pid));
    }

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let worker_dir = std::fs::canonicalize(&cli.worker_dir)
        .with_context(|| format!("invalid worker directory {}", cli.worker_dir.display()))?;
    let testing_dir = worker_dir.join("testing");
    std::fs::create_dir_all(&testing_dir)
        .with_context(|| format!("unable to create {}", testing_dir.display()))?;

    let log_path = worker_dir.join("api.log");
    apilog::backup(&log_path);
    apilog::init(&log_path);

    let cache = match &cli.global_cache {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("unable to create cache directory {}", dir.display()))?;
            ObjectCache::new(dir)
        }
        None => ObjectCache::disabled(),
    };

    let http = reqwest::Client::builder()
        .build()
        .context("unable to build the http client")?;

    let worker_info = WorkerInfo {
        username: cli.username.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        concurrency: cli.concurrency,
        unique_key: unique_key(),
        nps: 0.0,
    };
    info!(
        "montytest-worker {} concurrency={} key={}",
        worker_info.version, worker_info.concurrency, worker_info.unique_key
    );

    let env = WorkerEnv {
        http,
        remote: cli.remote.trim_end_matches('/').to_string(),
        password: cli.password.clone(),
        worker_dir,
        testing_dir,
        cache,
        concurrency: cli.concurrency.max(1),
        clear_binaries: cli.clear_binaries,
        worker_info,
    };

    let controller = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(controller, shutdown_tx);

    let mut stop_requested = false;
    while !stop_requested {
        let cycle = run_one_cycle(&env);
        tokio::pin!(cycle);
        loop {
            tokio::select! {
                event = shutdown_rx.recv() => match event {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!(
                            "Stop requested — finishing the current task before exiting \
                             (press CTRL+C again to exit immediately)."
                        );
                        stop_requested = true;
                    }
                    Some(ShutdownEvent::Immediate) | None => {
                        eprintln!("Stop requested again — exiting immediately.");
                        // Dropping the cycle future tears down any child
                        // processes it spawned.
                        return Ok(());
                    }
                },
                outcome = &mut cycle => {
                    if let Err(err) = outcome {
                        // Only fatal errors make it up here.
                        return Err(anyhow::anyhow!(err.to_string()));
                    }
                    break;
                }
            }
        }
    }

    info!("worker stopped");
    Ok(())
}
