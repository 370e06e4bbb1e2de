//! One-shot sandbox executor (spec §4.5).
//!
//! Grounded on the codex-rs `exec.rs` pattern retrieved alongside this
//! repo (a `tokio::spawn`-per-stream reader racing a `tokio::select!`
//! timeout) and on the teacher's `crates/sandbox/src/pinns.rs` for the
//! "wrap a `tokio::process::Command` invocation" shape. The escalation
//! ladder (TERM, grace, KILL) and the exact numeric `rc` values come from
//! `examples/original_source/test/unit/daemon_server.py`'s `ZerovmExecutor`.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;

const READ_CHUNK: usize = 4096;

#[derive(Error, Debug)]
pub enum OneshotError {
    #[error("failed to spawn sandbox process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("io error communicating with sandbox process: {0}")]
    Io(#[source] std::io::Error),
}

/// The sandbox's outcome code, matching the original daemon's `STATUS_*`
/// constants (`STATUS_STOP` is daemon-only and has no one-shot equivalent).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecRc {
    Ok = 0,
    Error = 1,
    Timeout = 2,
    Killed = 3,
    Overflow = 4,
}

impl ExecRc {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for ExecRc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

#[derive(Debug)]
pub struct ExecOutcome {
    pub rc: ExecRc,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

enum Phase {
    Running,
    Terminated(Instant),
    Killed,
}

/// Runs `exename <manifest_path> [-s]` to completion (spec §4.5). The
/// manifest file is unlinked afterwards regardless of outcome. When
/// `on_stdout` is given, a snapshot of the accumulated stdout is sent
/// through it every time more of it arrives, letting a caller (the
/// resident daemon's `STATUS`) observe a still-running job's output
/// rather than only the final result.
#[allow(clippy::too_many_arguments)]
pub async fn run_oneshot(
    exename: &Path,
    manifest_path: &Path,
    pre_validated: bool,
    timeout: Duration,
    kill_timeout: Duration,
    max_stdout: usize,
    max_stderr: usize,
    on_stdout: Option<tokio::sync::mpsc::UnboundedSender<Vec<u8>>>,
) -> Result<ExecOutcome, OneshotError> {
    let result = run_once(
        exename,
        manifest_path,
        pre_validated,
        timeout,
        kill_timeout,
        max_stdout,
        max_stderr,
        on_stdout,
    )
    .await;
    let _ = tokio::fs::remove_file(manifest_path).await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_once(
    exename: &Path,
    manifest_path: &Path,
    pre_validated: bool,
    timeout: Duration,
    kill_timeout: Duration,
    max_stdout: usize,
    max_stderr: usize,
    on_stdout: Option<tokio::sync::mpsc::UnboundedSender<Vec<u8>>>,
) -> Result<ExecOutcome, OneshotError> {
    let mut cmd = Command::new(exename);
    cmd.arg(manifest_path);
    if pre_validated {
        cmd.arg("-s");
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(OneshotError::Spawn)?;
    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut chunk = [0u8; READ_CHUNK];

    let mut phase = Phase::Running;
    let wall_deadline = Instant::now() + timeout;

    loop {
        if !stdout_open && !stderr_open {
            return finish(&mut child, &phase, stdout_buf, stderr_buf).await;
        }

        let sleep_deadline = match phase {
            Phase::Running => wall_deadline,
            Phase::Terminated(d) => d,
            Phase::Killed => unreachable!("Killed phase always returns immediately"),
        };

        tokio::select! {
            biased;

            res = stdout.read(&mut chunk), if stdout_open => {
                let n = res.map_err(OneshotError::Io)?;
                if n == 0 {
                    stdout_open = false;
                } else {
                    stdout_buf.extend_from_slice(&chunk[..n]);
                    if let Some(tx) = &on_stdout {
                        let _ = tx.send(stdout_buf.clone());
                    }
                    if stdout_buf.len() > max_stdout || stderr_buf.len() > max_stderr {
                        return overflow(&mut child, stdout_buf, stderr_buf).await;
                    }
                }
            }

            res = stderr.read(&mut chunk), if stderr_open => {
                let n = res.map_err(OneshotError::Io)?;
                if n == 0 {
                    stderr_open = false;
                } else {
                    stderr_buf.extend_from_slice(&chunk[..n]);
                    if stdout_buf.len() > max_stdout || stderr_buf.len() > max_stderr {
                        return overflow(&mut child, stdout_buf, stderr_buf).await;
                    }
                }
            }

            _ = tokio::time::sleep_until(sleep_deadline) => {
                match phase {
                    Phase::Running => {
                        send_signal(&child, Signal::SIGTERM);
                        phase = Phase::Terminated(Instant::now() + kill_timeout);
                    }
                    Phase::Terminated(_) => {
                        child.start_kill().map_err(OneshotError::Io)?;
                        phase = Phase::Killed;
                        return finish(&mut child, &phase, stdout_buf, stderr_buf).await;
                    }
                    Phase::Killed => unreachable!(),
                }
            }
        }
    }
}

fn send_signal(child: &Child, sig: Signal) {
    if let Some(id) = child.id() {
        let _ = signal::kill(Pid::from_raw(id as i32), sig);
    }
}

async fn overflow(
    child: &mut Child,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
) -> Result<ExecOutcome, OneshotError> {
    let _ = child.start_kill();
    let _ = child.wait().await;
    Ok(ExecOutcome {
        rc: ExecRc::Overflow,
        stdout,
        stderr,
    })
}

/// Blocking final collection: waits for the child to exit and drains any
/// remaining buffered output, mirroring the Python original's
/// `_get_final_status`'s trailing `proc.communicate()`.
async fn finish(
    child: &mut Child,
    phase: &Phase,
    mut stdout: Vec<u8>,
    mut stderr: Vec<u8>,
) -> Result<ExecOutcome, OneshotError> {
    if let Some(mut pipe) = child.stdout.take() {
        let _ = pipe.read_to_end(&mut stdout).await;
    }
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_end(&mut stderr).await;
    }
    let status = child.wait().await.map_err(OneshotError::Io)?;

    let rc = match phase {
        Phase::Killed => ExecRc::Killed,
        Phase::Terminated(_) => ExecRc::Timeout,
        Phase::Running => {
            if status.success() {
                ExecRc::Ok
            } else {
                ExecRc::Error
            }
        }
    };

    Ok(ExecOutcome { rc, stdout, stderr })
}
