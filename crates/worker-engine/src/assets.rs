//! Network, opening-book and source-archive provisioning.
//!
//! Network files are content-addressed: the canonical name
//! `nn-<12 hex>.network` carries the first 12 hex characters of the
//! SHA-256 of the content, and nothing is trusted until that matches.
//! Downloads go through the shared on-disk cache where one is
//! configured.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use regex::Regex;
use sha2::{Digest as _, Sha256};
use tracing::{info, warn};

use montytest_worker_core::cache::ObjectCache;
use montytest_worker_core::error::{ErrorKind, Result, WorkerError};

use crate::coordinator::{HTTP_TIMEOUT, get_bytes};

const RAWCONTENT_HOST: &str = "https://raw.githubusercontent.com";
const API_HOST: &str = "https://api.github.com";
const BOOKS_OWNER: &str = "official-monty";
const BOOKS_REPO: &str = "books";
const BOOKS_BRANCH: &str = "master";

const NET_RETRY_DELAY: Duration = Duration::from_secs(15);
const NET_ATTEMPTS: u32 = 5;

/// Pattern of a default-network reference, also reused by the builder
/// when scanning engine sources.
pub(crate) static NET_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"nn-[a-f0-9]{12}\.network").expect("net name pattern"));

/// The 12-hex content address embedded in a canonical network name.
fn net_hash_prefix(name: &str) -> Option<&str> {
    if !NET_NAME_RE.is_match(name) {
        return None;
    }
    name.get(3..15)
}

/// True when `bytes` hash to the address carried by `name`.
pub fn net_matches_name(name: &str, bytes: &[u8]) -> bool {
    let Some(expected) = net_hash_prefix(name) else {
        return false;
    };
    let digest = Sha256::digest(bytes);
    let prefix: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    prefix == expected
}

/// Validate the copy of `name` sitting in `dir`. Missing or unreadable
/// files simply fail validation.
pub fn validate_net(dir: &Path, name: &str) -> bool {
    match std::fs::read(dir.join(name)) {
        Ok(bytes) => net_matches_name(name, &bytes),
        Err(_) => false,
    }
}

async fn download_net(
    http: &reqwest::Client,
    remote: &str,
    dest_dir: &Path,
    name: &str,
    cache: &ObjectCache,
) -> Result<()> {
    let content = match cache.read(name) {
        Some(bytes) => {
            info!("using {name} from global cache");
            bytes
        }
        None => {
            info!("downloading {name}");
            let url = format!("{remote}/api/nn/{name}");
            let bytes = get_bytes(http, &url, HTTP_TIMEOUT).await?;
            if net_matches_name(name, &bytes) {
                cache.write(name, &bytes);
            }
            bytes
        }
    };
    std::fs::write(dest_dir.join(name), &content)
        .map_err(|err| WorkerError::run(format!("unable to write {name}: {err}")))?;
    Ok(())
}

/// Make sure a validated copy of `name` exists in `dest_dir`,
/// downloading (and caching) as needed. Transient failures are retried
/// with a linear back-off of `15 * attempt` seconds; fatal errors are
/// re-raised immediately.
pub async fn establish_validated_net(
    http: &reqwest::Client,
    remote: &str,
    dest_dir: &Path,
    name: &str,
    cache: &ObjectCache,
) -> Result<()> {
    if dest_dir.join(name).exists() && validate_net(dest_dir, name) {
        return Ok(());
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = async {
            download_net(http, remote, dest_dir, name, cache).await?;
            if !validate_net(dest_dir, name) {
                return Err(WorkerError::run(format!(
                    "failed to validate the network: {name}"
                )));
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => return Ok(()),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                if attempt > NET_ATTEMPTS {
                    return Err(err);
                }
                let wait = NET_RETRY_DELAY * attempt;
                warn!(
                    "failed to download {name} in attempt {attempt}, trying in {} seconds",
                    wait.as_secs()
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// `https://github.com/<owner>/<repo>` → its REST API base.
pub fn github_api(repo_url: &str) -> String {
    repo_url.replace("https://github.com", "https://api.github.com/repos")
}

async fn download_from_github_raw(
    http: &reqwest::Client,
    owner: &str,
    repo: &str,
    branch: &str,
    item: &str,
) -> Result<Vec<u8>> {
    let url = format!("{RAWCONTENT_HOST}/{owner}/{repo}/{branch}/{item}");
    info!("downloading {url}");
    get_bytes(http, &url, HTTP_TIMEOUT).await
}

async fn download_from_github_api(
    http: &reqwest::Client,
    owner: &str,
    repo: &str,
    branch: &str,
    item: &str,
) -> Result<Vec<u8>> {
    let url = format!("{API_HOST}/repos/{owner}/{repo}/contents/{item}?ref={branch}");
    info!("downloading {url}");
    let meta: serde_json::Value = serde_json::from_slice(&get_bytes(http, &url, HTTP_TIMEOUT).await?)
        .map_err(|err| WorkerError::transport(format!("unexpected reply from {url}: {err}")))?;
    let git_url = meta
        .get("git_url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| WorkerError::transport(format!("no git_url in reply from {url}")))?;

    let blob: serde_json::Value =
        serde_json::from_slice(&get_bytes(http, git_url, HTTP_TIMEOUT).await?)
            .map_err(|err| WorkerError::transport(format!("unexpected reply from {git_url}: {err}")))?;
    let content = blob
        .get("content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| WorkerError::transport(format!("no content in reply from {git_url}")))?;
    // The API wraps the base64 payload across lines.
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    B64.decode(compact)
        .map_err(|err| WorkerError::transport(format!("undecodable content from {git_url}: {err}")))
}

/// Fetch a blob from GitHub: raw host first, contents API as fallback.
pub async fn download_from_github(
    http: &reqwest::Client,
    owner: &str,
    repo: &str,
    branch: &str,
    item: &str,
) -> Result<Vec<u8>> {
    match download_from_github_raw(http, owner, repo, branch, item).await {
        Ok(blob) => Ok(blob),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!("downloading {item} failed: {err}; trying the github api");
            download_from_github_api(http, owner, repo, branch, item)
                .await
                .map_err(|inner| {
                    WorkerError::wrap(
                        ErrorKind::Transport,
                        format!("unable to download {item}: {inner}"),
                        inner,
                    )
                })
        }
    }
}

/// Extract a zip blob into `dest` and return the archived names.
pub fn unzip(blob: &[u8], dest: &Path) -> Result<Vec<String>> {
    let reader = std::io::Cursor::new(blob);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|err| WorkerError::run(format!("unable to open zip archive: {err}")))?;
    let names: Vec<String> = archive.file_names().map(str::to_owned).collect();
    archive
        .extract(dest)
        .map_err(|err| WorkerError::run(format!("unable to extract zip archive: {err}")))?;
    Ok(names)
}

/// Character-wise common prefix, used to locate the single top-level
/// directory of a source zipball.
pub fn common_prefix(names: &[String]) -> String {
    let Some(first) = names.first() else {
        return String::new();
    };
    let mut prefix = first.as_str();
    for name in &names[1..] {
        let shared = prefix
            .char_indices()
            .zip(name.chars())
            .take_while(|((_, a), b)| a == b)
            .count();
        let end = prefix
            .char_indices()
            .nth(shared)
            .map(|(idx, _)| idx)
            .unwrap_or(prefix.len());
        prefix = &prefix[..end];
    }
    prefix.to_string()
}

/// Make sure the opening book is present (and non-empty) in the testing
/// directory, downloading and extracting `<book>.zip` when it is not.
pub async fn ensure_book(http: &reqwest::Client, testing_dir: &Path, book: &str) -> Result<()> {
    let path = testing_dir.join(book);
    let present = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
    if present {
        return Ok(());
    }
    let blob = download_from_github(
        http,
        BOOKS_OWNER,
        BOOKS_REPO,
        BOOKS_BRANCH,
        &format!("{book}.zip"),
    )
    .await?;
    unzip(&blob, testing_dir)?;
    Ok(())
}
