//! Typed HTTP client for the coordinator API.
//!
//! All coordinator endpoints are JSON-in/JSON-out POSTs. A POST never
//! fails on HTTP status alone: the reply body carries an `error` field
//! when the server rejected the request, and supervisors decide what to
//! do with it. A reply that is not a JSON object is a transport error.
//! Every call is recorded in the append-only API log together with the
//! server-reported `duration` and the client-observed latency.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use montytest_worker_core::apilog;
use montytest_worker_core::error::{Result, WorkerError};
use montytest_worker_core::stats::GameStats;

pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const UPDATE_RETRY_DELAY: Duration = Duration::from_secs(15);
const UPDATE_ATTEMPTS: u32 = 5;

/// Identity block attached to every coordinator request.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub username: String,
    pub version: String,
    pub concurrency: usize,
    pub unique_key: String,
    pub nps: f64,
}

/// The `update_task` / `request_spsa` request body: credentials, task
/// coordinates, and the cumulative statistics seen so far.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub password: String,
    pub run_id: String,
    pub task_id: u64,
    pub stats: GameStats,
    pub worker_info: WorkerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spsa: Option<SpsaState>,
}

/// Per-batch SPSA result block, reset at every batch start.
#[derive(Debug, Clone, Serialize)]
pub struct SpsaState {
    pub num_games: u64,
    pub wins: u64,
    pub losses: u64,
    pub draws: u64,
}

/// Mutable bookkeeping for the task currently being executed.
#[derive(Debug, Clone, Default)]
pub struct TaskState {
    pub last_updated: Option<DateTime<Utc>>,
    pub games_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskReply {
    #[serde(default)]
    pub task_alive: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpsaParam {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
pub struct SpsaReply {
    #[serde(default)]
    pub task_alive: bool,
    #[serde(default)]
    pub w_params: Vec<SpsaParam>,
    #[serde(default)]
    pub b_params: Vec<SpsaParam>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskRequest {
    pub password: String,
    pub worker_info: WorkerInfo,
}

#[derive(Debug, Deserialize)]
pub struct RequestTaskReply {
    pub run: Option<Run>,
    pub task_id: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FailedTaskReport {
    pub password: String,
    pub run_id: String,
    pub task_id: u64,
    pub message: String,
    pub worker_info: WorkerInfo,
}

/// One test run as handed out by the coordinator, restricted to the
/// fields the worker consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    #[serde(rename = "_id")]
    pub id: String,
    pub args: RunArgs,
    pub my_task: Task,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunArgs {
    pub tc: String,
    pub new_tc: Option<String>,
    pub book: String,
    #[serde(deserialize_with = "flexible_i64")]
    pub book_depth: i64,
    #[serde(deserialize_with = "flexible_u64")]
    pub threads: u64,
    pub new_options: String,
    pub base_options: String,
    pub resolved_new: String,
    pub resolved_base: String,
    #[serde(deserialize_with = "flexible_u64")]
    pub new_signature: u64,
    #[serde(deserialize_with = "flexible_u64")]
    pub base_signature: u64,
    pub new_tag: String,
    pub base_tag: String,
    pub tests_repo: Option<String>,
    pub sprt: Option<SprtParams>,
    /// Presence selects SPSA tuning mode; the tuner state itself is
    /// server-side.
    pub spsa: Option<serde_json::Value>,
    #[serde(default)]
    pub datagen: bool,
    #[serde(default = "default_true")]
    pub adjudication: bool,
    pub nodes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SprtParams {
    #[serde(default = "default_sprt_batch_size")]
    pub batch_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    pub num_games: u64,
    pub start: Option<u64>,
    pub stats: Option<GameStats>,
}

fn default_true() -> bool {
    true
}

fn default_sprt_batch_size() -> u64 {
    1
}

/// Accept both JSON numbers and numeric strings; the coordinator is not
/// consistent about which it sends for run arguments.
fn flexible_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn flexible_i64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// GET raw bytes. Unlike POSTs, a non-2xx status is an error here.
pub async fn get_bytes(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let response = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|err| WorkerError::transport(format!("get request to {url} failed: {err}")))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|err| WorkerError::transport(format!("get request to {url} failed: {err}")))?;
    Ok(bytes.to_vec())
}

/// POST a JSON payload and return the reply object. The reply must be a
/// JSON object; `error` and `info` fields are surfaced, and the call is
/// recorded in the API log.
pub async fn post_api<T: Serialize>(
    http: &reqwest::Client,
    url: &str,
    payload: &T,
) -> Result<serde_json::Value> {
    let started_at = Instant::now();
    let response = http
        .post(url)
        .timeout(HTTP_TIMEOUT)
        .json(payload)
        .send()
        .await
        .map_err(|err| WorkerError::transport(format!("post request to {url} failed: {err}")))?;
    let reply: serde_json::Value = response.json().await.map_err(|_| {
        WorkerError::transport(format!(
            "the reply to post request {url} was not a json encoded dictionary"
        ))
    })?;
    if !reply.is_object() {
        return Err(WorkerError::transport(format!(
            "the reply to post request {url} was not a json encoded dictionary"
        )));
    }

    if let Some(error) = reply.get("error").and_then(|v| v.as_str()) {
        warn!("error from remote: {error}");
    }

    let wall_ms = started_at.elapsed().as_secs_f64() * 1000.0;
    let server_ms = reply.get("duration").and_then(|v| v.as_f64()).unwrap_or(0.0) * 1000.0;
    apilog::append(&format!("{server_ms:6.2} ms (s)  {wall_ms:7.2} ms (w)  {url}"));
    if let Some(extra) = reply.get("info").and_then(|v| v.as_str()) {
        info!("info from remote: {extra}");
    }
    debug!("post request {url} handled in {wall_ms:.2}ms (server: {server_ms:.2}ms)");

    Ok(reply)
}

async fn post_typed<T: Serialize, R: for<'de> Deserialize<'de>>(
    http: &reqwest::Client,
    url: &str,
    payload: &T,
) -> Result<R> {
    let reply = post_api(http, url, payload).await?;
    serde_json::from_value(reply)
        .map_err(|err| WorkerError::transport(format!("unexpected reply from {url}: {err}")))
}

pub async fn update_task(
    http: &reqwest::Client,
    remote: &str,
    report: &TaskReport,
) -> Result<UpdateTaskReply> {
    post_typed(http, &format!("{remote}/api/update_task"), report).await
}

pub async fn request_spsa(
    http: &reqwest::Client,
    remote: &str,
    report: &TaskReport,
) -> Result<SpsaReply> {
    post_typed(http, &format!("{remote}/api/request_spsa"), report).await
}

pub async fn request_task(
    http: &reqwest::Client,
    remote: &str,
    request: &TaskRequest,
) -> Result<RequestTaskReply> {
    post_typed(http, &format!("{remote}/api/request_task"), request).await
}

pub async fn failed_task(
    http: &reqwest::Client,
    remote: &str,
    report: &FailedTaskReport,
) -> Result<serde_json::Value> {
    post_api(http, &format!("{remote}/api/failed_task"), report).await
}

/// POST the current statistics, retrying on failure. Returns `false`
/// when the coordinator no longer needs games for this task (the only
/// authoritative cancellation signal).
///
/// Up to five attempts spaced 15 s apart. A fatal error is re-raised at
/// once. A reply carrying `error` ends the retry loop and counts as
/// committed: the server has seen and judged this update, so resending
/// it cannot help.
pub async fn update_task_with_retry(
    http: &reqwest::Client,
    remote: &str,
    report: &TaskReport,
) -> Result<bool> {
    for _ in 0..UPDATE_ATTEMPTS {
        match update_task(http, remote, report).await {
            Ok(reply) => {
                if reply.error.is_some() {
                    return Ok(true);
                }
                if !reply.task_alive {
                    info!("the server told us that no more games are needed for the current task");
                    return Ok(false);
                }
                return Ok(true);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!("exception calling update_task: {err}");
                tokio::time::sleep(UPDATE_RETRY_DELAY).await;
            }
        }
    }
    Err(WorkerError::run("too many failed update attempts"))
}
