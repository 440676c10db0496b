//! Append-only log of coordinator API calls.
//!
//! One line per request with server-reported and client-observed
//! latency. The log is process-global, initialised once at startup and
//! guarded by a mutex since supervisors on different tasks may append
//! concurrently. Appends are best effort: a worker must never fail a
//! task because its log file is unwritable.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::Utc;

static API_LOG: OnceLock<ApiLog> = OnceLock::new();

struct ApiLog {
    path: PathBuf,
    lock: Mutex<()>,
}

/// Rotate an existing log out of the way before [`init`]. Errors are
/// reported to stderr and otherwise ignored.
pub fn backup(path: &Path) {
    if !path.exists() {
        return;
    }
    let previous = path.with_extension("log.previous");
    if let Err(err) = std::fs::rename(path, &previous) {
        eprintln!(
            "failed to move {} to {}: {err}",
            path.display(),
            previous.display()
        );
    }
}

/// Install the log path. Only the first call has any effect.
pub fn init(path: impl Into<PathBuf>) {
    let _ = API_LOG.set(ApiLog {
        path: path.into(),
        lock: Mutex::new(()),
    });
}

/// Append one line, prefixed with the current UTC time. A no-op until
/// [`init`] has run.
pub fn append(line: &str) {
    let Some(log) = API_LOG.get() else {
        return;
    };
    let _guard = log.lock.lock().unwrap_or_else(|poison| poison.into_inner());
    let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log.path)
    else {
        return;
    };
    let _ = writeln!(file, "{} : {}", Utc::now(), line);
}
