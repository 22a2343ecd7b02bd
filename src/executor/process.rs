// src/executor/process.rs
//
// Process-group spawn/wait/signal helpers for the SPAWN/WAIT stages. Every
// child is placed in its own process group so a timeout or cancellation
// can signal the whole tree, not just the immediate child.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::fs::File;
use tokio::process::{Child, Command};

pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
    TimedOut,
}

/// Spawns `/bin/bash <script_path>` in a new process group with stdout/
/// stderr redirected to the given files and CWD set to `work_dir`.
pub async fn spawn_job(
    script_path: &Path,
    work_dir: &Path,
    env: &HashMap<String, String>,
    stdout: File,
    stderr: File,
) -> std::io::Result<Child> {
    let mut cmd = Command::new("/bin/bash");
    cmd.arg(script_path)
        .current_dir(work_dir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout.into_std().await))
        .stderr(Stdio::from(stderr.into_std().await))
        .process_group(0);
    cmd.spawn()
}

/// Blocks until the child exits or `time_limit` elapses. On timeout, sends
/// SIGTERM to the process group, waits a 5s grace period, then SIGKILL.
pub async fn wait_with_timeout(child: &mut Child, time_limit: Option<Duration>) -> ExitOutcome {
    let wait_fut = child.wait();
    let status = match time_limit {
        None => Some(wait_fut.await),
        Some(limit) => match tokio::time::timeout(limit, wait_fut).await {
            Ok(status) => Some(status),
            Err(_) => None,
        },
    };

    let Some(status) = status else {
        terminate_process_group(child).await;
        return ExitOutcome::TimedOut;
    };

    match status {
        Ok(status) => to_outcome(status),
        Err(_) => ExitOutcome::TimedOut,
    }
}

fn to_outcome(status: std::process::ExitStatus) -> ExitOutcome {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitOutcome::Signaled(signal);
        }
    }
    ExitOutcome::Exited(status.code().unwrap_or(-1))
}

/// SIGTERM -> 5s grace -> SIGKILL against the child's process group.
pub async fn terminate_process_group(child: &mut Child) {
    let Some(pid) = child.id() else { return };
    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);

    if tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .is_ok()
    {
        return;
    }

    let _ = killpg(pgid, Signal::SIGKILL);
    let _ = child.wait().await;
}

/// Sends SIGTERM to a recorded PID's process group — used by the API
/// cancel path.
pub fn send_sigterm_to_group(pid: i32) {
    let _ = killpg(Pid::from_raw(pid), Signal::SIGTERM);
}
