//! Build one monty revision from source.
//!
//! Sources come as a GitHub zipball (cache first), land in a throwaway
//! build directory, and are compiled with the repository's own make
//! targets. The default value and policy networks referenced by the
//! sources are validated and linked into the tree before the build, so
//! `make` can embed them. The build directory is removed on every exit
//! path.

use std::path::Path;

use tracing::info;

use montytest_worker_core::error::{Result, WorkerError};

use crate::assets::{NET_NAME_RE, common_prefix, establish_validated_net, github_api, unzip};
use crate::coordinator::get_bytes;
use crate::task::WorkerEnv;

/// Source zipballs are much larger than API calls; give them room.
const SOURCE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Find the network referenced next to `tag` in one of the well-known
/// source files.
fn default_net_from_source(source: &Path, tag: &str) -> Result<String> {
    let text = std::fs::read_to_string(source).map_err(|err| {
        WorkerError::build(format!("unable to read {}: {err}", source.display()))
    })?;
    for line in text.lines() {
        if !line.contains(tag) {
            continue;
        }
        if let Some(found) = NET_NAME_RE.find(line) {
            return Ok(found.as_str().to_string());
        }
    }
    Err(WorkerError::build(format!(
        "no default network referenced by {tag} in {}",
        source.display()
    )))
}

/// Download, extract and build `revision`, installing the executable at
/// `destination`. `datagen` selects the data-generation make target.
pub async fn setup_engine(
    env: &WorkerEnv,
    destination: &Path,
    revision: &str,
    repo_url: &str,
    datagen: bool,
) -> Result<()> {
    let build_dir = tempfile::tempdir_in(&env.worker_dir).map_err(|err| {
        WorkerError::build(format!("unable to create a build directory: {err}"))
    })?;

    let archive_name = format!("{revision}.zip");
    let (blob, freshly_downloaded) = match env.cache.read(&archive_name) {
        Some(blob) => {
            info!("using {archive_name} from global cache");
            (blob, false)
        }
        None => {
            let url = format!("{}/zipball/{revision}", github_api(repo_url));
            info!("downloading {url}");
            (get_bytes(&env.http, &url, SOURCE_TIMEOUT).await?, true)
        }
    };

    let names = unzip(&blob, build_dir.path())?;
    // Only archives that extracted cleanly are worth sharing.
    if freshly_downloaded {
        env.cache.write(&archive_name, &blob);
    }

    let prefix = common_prefix(&names);
    let root = match prefix.rfind('/') {
        Some(idx) => &prefix[..idx],
        None => "",
    };
    let source_root = build_dir.path().join(root);

    let value_net = default_net_from_source(
        &source_root.join("src/networks/value.rs"),
        "ValueFileDefaultName",
    )?;
    info!("build uses default value net: {value_net}");
    establish_validated_net(&env.http, &env.remote, &env.testing_dir, &value_net, &env.cache)
        .await?;
    copy_net(&env.testing_dir, &source_root, &value_net)?;

    let policy_net = default_net_from_source(
        &source_root.join("src/networks/policy.rs"),
        "PolicyFileDefaultName",
    )?;
    info!("build uses default policy net: {policy_net}");
    establish_validated_net(&env.http, &env.remote, &env.testing_dir, &policy_net, &env.cache)
        .await?;
    copy_net(&env.testing_dir, &source_root, &policy_net)?;

    if destination.exists() {
        return Err(WorkerError::fatal(
            "another worker is running in the same directory!",
        ));
    }

    let target = if datagen { "gen" } else { "montytest" };
    info!("building {revision} with make {target}");
    let output = tokio::process::Command::new("make")
        .arg(target)
        .arg(format!("EXE={}", destination.display()))
        .current_dir(&source_root)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .map_err(|err| WorkerError::build(format!("unable to run make {target}: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorkerError::build(format!(
            "make {target} failed with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

fn copy_net(testing_dir: &Path, source_root: &Path, net: &str) -> Result<()> {
    std::fs::copy(testing_dir.join(net), source_root.join(net))
        .map(|_| ())
        .map_err(|err| {
            WorkerError::build(format!("unable to place {net} into the source tree: {err}"))
        })
}
