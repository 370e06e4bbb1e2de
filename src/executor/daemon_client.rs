//! Resident-daemon sandbox executor path (spec §4.6).
//!
//! The daemon speaks the same 8-byte report framing as a plain sandbox
//! invocation (`crate::codec::report_frame`); the client side here is a
//! thin connect/send/receive wrapper, grounded on
//! `examples/original_source/test/unit/daemon_client.py` for the overall
//! shape (connect, send, read one framed reply, close).

use crate::codec::report_frame::{read_report, write_report, ReportFrameError};
use crate::executor::oneshot::{run_oneshot, ExecOutcome, ExecRc, OneshotError};
use crate::manifest::Manifest;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;

#[derive(Error, Debug)]
pub enum DaemonClientError {
    #[error("could not connect to daemon socket {0:?}: {1}")]
    ConnectFailed(PathBuf, #[source] std::io::Error),
    #[error("daemon request timed out")]
    Timeout,
    #[error("io error talking to daemon: {0}")]
    Io(#[source] std::io::Error),
    #[error("malformed report from daemon: {0}")]
    Report(#[from] ReportFrameError),
    #[error("restarted daemon reported an unhealthy status")]
    RestartUnhealthy { report: Vec<u8> },
    #[error("daemon restart failed: {0}")]
    RestartFailed(#[from] OneshotError),
}

/// Sends `manifest` to an already-listening daemon and returns its raw
/// report bytes. Distinguishes "never connected" (caller should attempt a
/// restart) from "connected, then timed out/errored" (caller maps to
/// [`ExecRc::Timeout`]/[`ExecRc::Error`], per spec §4.6 step 1).
async fn connect(socket_path: &Path) -> Result<UnixStream, DaemonClientError> {
    UnixStream::connect(socket_path)
        .await
        .map_err(|e| DaemonClientError::ConnectFailed(socket_path.to_path_buf(), e))
}

async fn send_and_receive(
    stream: &mut UnixStream,
    manifest: &[u8],
    request_timeout: Duration,
    max_report: usize,
) -> Result<Vec<u8>, DaemonClientError> {
    tokio::time::timeout(request_timeout, async {
        write_report(stream, manifest)
            .await
            .map_err(DaemonClientError::from)?;
        read_report(stream, max_report)
            .await
            .map_err(DaemonClientError::from)
    })
    .await
    .map_err(|_| DaemonClientError::Timeout)?
}

/// The sixth, optional "daemon status" value described in spec §3's
/// ReportTuple: `1` on the fifth (status) line's leading token means the
/// freshly spawned daemon is ready to accept connections.
fn daemon_status(report: &[u8]) -> Option<u8> {
    let text = String::from_utf8_lossy(report);
    let status_field = text.splitn(5, '\n').nth(4)?;
    status_field.split_whitespace().next()?.parse().ok()
}

/// Runs the §4.6 resident-daemon path end to end. `daemon_nexe` is the
/// already-resolved path to the daemon binary in the system image, used
/// only if the daemon is found to be absent.
pub async fn run_via_daemon(
    socket_path: &Path,
    manifest_bytes: &[u8],
    manifest: &Manifest,
    daemon_nexe: &Path,
    daemon_kill_timeout: Duration,
    daemon_max_stdout: usize,
    daemon_max_stderr: usize,
    request_timeout: Duration,
    max_report: usize,
) -> Result<ExecOutcome, DaemonClientError> {
    match connect(socket_path).await {
        Ok(mut stream) => {
            match send_and_receive(&mut stream, manifest_bytes, request_timeout, max_report).await
            {
                Ok(report) => Ok(ExecOutcome {
                    rc: ExecRc::Ok,
                    stdout: report,
                    stderr: Vec::new(),
                }),
                Err(DaemonClientError::Timeout) => Ok(ExecOutcome {
                    rc: ExecRc::Timeout,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }),
                Err(DaemonClientError::Io(_)) | Err(DaemonClientError::Report(_)) => Ok(ExecOutcome {
                    rc: ExecRc::Error,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }),
                Err(other) => Err(other),
            }
        }
        Err(DaemonClientError::ConnectFailed(path, _)) => {
            restart_and_retry(
                &path,
                manifest_bytes,
                manifest,
                daemon_nexe,
                daemon_kill_timeout,
                daemon_max_stdout,
                daemon_max_stderr,
                request_timeout,
                max_report,
            )
            .await
        }
        Err(other) => Err(other),
    }
}

/// The daemon-absent branch: boots the daemon nexe once via one-shot
/// execution, checks its reported daemon-status, then retries the real
/// send exactly once. A second failure is the caller's to turn into
/// `InternalError` (this function returns `Err` in that case).
async fn restart_and_retry(
    socket_path: &Path,
    manifest_bytes: &[u8],
    manifest: &Manifest,
    daemon_nexe: &Path,
    daemon_kill_timeout: Duration,
    daemon_max_stdout: usize,
    daemon_max_stderr: usize,
    request_timeout: Duration,
    max_report: usize,
) -> Result<ExecOutcome, DaemonClientError> {
    let bootstrap_manifest = manifest.clone().with_program(daemon_nexe.to_path_buf());
    let mut bootstrap_text = bootstrap_manifest.render();
    bootstrap_text.push_str(&format!("Job = {}\n", socket_path.display()));

    let bootstrap_path = write_temp_manifest(&bootstrap_text).await.map_err(DaemonClientError::Io)?;

    let outcome = run_oneshot(
        daemon_nexe,
        &bootstrap_path,
        false,
        Duration::from_secs(manifest.timeout + 1),
        daemon_kill_timeout,
        daemon_max_stdout,
        daemon_max_stderr,
        None,
    )
    .await?;

    match daemon_status(&outcome.stdout) {
        Some(1) => {
            let mut stream = connect(socket_path).await?;
            send_and_receive(&mut stream, manifest_bytes, request_timeout, max_report)
                .await
                .map(|report| ExecOutcome {
                    rc: ExecRc::Ok,
                    stdout: report,
                    stderr: Vec::new(),
                })
        }
        _ => Err(DaemonClientError::RestartUnhealthy {
            report: outcome.stdout,
        }),
    }
}

async fn write_temp_manifest(text: &str) -> std::io::Result<PathBuf> {
    let mut file = tempfile::NamedTempFile::new()?;
    use std::io::Write;
    file.write_all(text.as_bytes())?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_status_reads_fifth_line_leading_token() {
        let report = b"0\n0\n/dev/stdout abc\n0 0 0 0 0 0 0 0 0 0\n1 daemon ready\n";
        assert_eq!(daemon_status(report), Some(1));
    }

    #[test]
    fn daemon_status_none_when_not_numeric() {
        let report = b"0\n0\n/dev/stdout abc\n0 0 0 0 0 0 0 0 0 0\nnot-a-number\n";
        assert_eq!(daemon_status(report), None);
    }

    #[test]
    fn daemon_status_none_when_report_too_short() {
        let report = b"0\n0\n";
        assert_eq!(daemon_status(report), None);
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-socket");
        let err = connect(&missing).await;
        assert!(matches!(err, Err(DaemonClientError::ConnectFailed(_, _))));
    }

    #[tokio::test]
    async fn round_trip_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("daemon.sock");
        let listener = tokio::net::UnixListener::bind(&sock_path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let manifest = read_report(&mut stream, 1 << 20).await.unwrap();
            assert_eq!(manifest, b"Version = 20130611\n");
            write_report(&mut stream, b"0\n0\n/dev/stdout abc\n0 0 0 0 0 0 0 0 0 0\nok\n")
                .await
                .unwrap();
        });

        let mut stream = connect(&sock_path).await.unwrap();
        let report = send_and_receive(
            &mut stream,
            b"Version = 20130611\n",
            Duration::from_secs(5),
            1 << 20,
        )
        .await
        .unwrap();
        assert_eq!(report, b"0\n0\n/dev/stdout abc\n0 0 0 0 0 0 0 0 0 0\nok\n");

        server.await.unwrap();
    }
}
