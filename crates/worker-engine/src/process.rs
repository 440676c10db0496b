//! Child-process plumbing shared by the supervisors.
//!
//! Children run with both stdio streams captured and line-pumped into a
//! single unbounded channel, so a supervisor stays the only consumer
//! and can poll without selecting on file descriptors. Termination is
//! two-step: a polite interrupt first, a forced kill of the whole
//! process tree after a 15 second grace period.
//!
//! On unix every child gets its own process group (interrupt is a
//! `SIGINT` to the child, the forced kill a `SIGKILL` to the group).
//! On windows the child gets its own console, and the interrupt is a
//! Ctrl-C event raised by a helper process that attaches to that
//! console; the parent cannot do this itself without giving up its own
//! console.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const KILL_TIMEOUT: Duration = Duration::from_secs(15);

#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

/// Argument that turns the worker binary into the windows Ctrl-C
/// helper; see [`run_ctrl_c_helper`].
pub const CTRL_C_HELPER_ARG: &str = "__ctrl-c-helper";

/// A command set up for supervised execution: stdio piped, killed when
/// its handle is dropped, isolated for group signalling.
pub fn supervised_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        // New process group, so the forced kill can take descendants
        // down with the child.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(windows)]
    {
        cmd.creation_flags(CREATE_NEW_CONSOLE);
    }
    cmd
}

/// Funnel the child's stdout and stderr lines into one channel. Stream
/// interleaving is not preserved; match-critical data flows on stdout
/// only.
pub fn pump_lines(child: &mut Child) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    rx
}

/// Ask the child to stop. Best effort; failures only get logged.
pub fn send_interrupt(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    #[cfg(unix)]
    {
        unsafe {
            if libc::kill(pid as i32, libc::SIGINT) != 0 {
                warn!(
                    "failed to interrupt pid {pid}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
    #[cfg(windows)]
    {
        send_ctrl_c(pid);
    }
}

/// Dispatch a Ctrl-C event to `pid` from an isolated helper process.
#[cfg(windows)]
fn send_ctrl_c(pid: u32) {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            warn!("cannot locate worker binary for ctrl-c helper: {err}");
            return;
        }
    };
    match std::process::Command::new(exe)
        .arg(CTRL_C_HELPER_ARG)
        .arg(pid.to_string())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("ctrl-c helper exited with {status}"),
        Err(err) => warn!("failed to run ctrl-c helper: {err}"),
    }
}

/// Body of the helper process: drop our console, attach to the child's,
/// raise Ctrl-C there. Runs in a throwaway process because a console
/// can only be traded away, not shared.
#[cfg(windows)]
pub fn run_ctrl_c_helper(pid: u32) -> i32 {
    use winapi::um::consoleapi::SetConsoleCtrlHandler;
    use winapi::um::wincon::{AttachConsole, FreeConsole, GenerateConsoleCtrlEvent};

    unsafe {
        let ok = FreeConsole() != 0
            && SetConsoleCtrlHandler(None, 1) != 0
            && AttachConsole(pid) != 0
            && GenerateConsoleCtrlEvent(0, 0) != 0;
        if ok { 0 } else { 1 }
    }
}

#[cfg(not(windows))]
pub fn run_ctrl_c_helper(_pid: u32) -> i32 {
    1
}

/// Force-kill the child and all of its descendants.
pub async fn kill_process(child: &mut Child) {
    if let Some(pid) = child.id() {
        info!("killing pid {pid} and descendants");
        #[cfg(unix)]
        {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
        #[cfg(windows)]
        {
            let _ = std::process::Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
    if let Err(err) = child.kill().await {
        warn!("failed to reap child, possibly already terminated: {err}");
    }
}

/// Graceful-then-forceful shutdown. Returns the exit status when the
/// child ended within the grace period, `None` when it had to be
/// killed.
pub async fn shutdown_child(child: &mut Child) -> Option<ExitStatus> {
    send_interrupt(child);
    info!("waiting for child to finish");
    match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            warn!("failed to wait for child: {err}");
            None
        }
        Err(_) => {
            warn!("timeout waiting for child");
            kill_process(child).await;
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_merges_stdout_and_stderr() {
        let mut cmd = supervised_command("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let mut child = cmd.spawn().unwrap();
        let mut rx = pump_lines(&mut child);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        child.wait().await.unwrap();

        lines.sort();
        assert_eq!(lines, vec!["err".to_string(), "out".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_reports_a_clean_exit() {
        let mut cmd = supervised_command("sh");
        cmd.args(["-c", "exit 0"]);
        let mut child = cmd.spawn().unwrap();
        // Give the child time to exit so the interrupt is a no-op.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = shutdown_child(&mut child).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn interrupt_stops_a_sleeping_child() {
        let mut cmd = supervised_command("sh");
        cmd.args(["-c", "sleep 60"]);
        let mut child = cmd.spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = shutdown_child(&mut child).await;
        // sh dies on SIGINT, well inside the grace period.
        assert!(status.map(|s| !s.success()).unwrap_or(true));
    }
}
