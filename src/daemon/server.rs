//! Resident daemon command dispatch (spec §4.7).
//!
//! Grounded on `examples/original_source/test/unit/daemon_server.py`'s
//! `ZerovmDaemon` for the exact command set, selector rules, and numeric
//! response codes, translated into the teacher's `tokio`-accept-loop idiom
//! (`src/server.rs`'s `tokio::select!` over a listener plus shutdown
//! signals).

use crate::codec::daemon_frame::{read_frame, write_error, write_frame, FrameError};
use crate::daemon::registry::Registry;
use crate::executor::{run_oneshot, ExecOutcome, ExecRc};
use crate::manifest::extract_job_node;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;

pub const NO_NODE_ID: &str = "250\nNo node id in request\n";
pub const NO_JOB_ID: &str = "251\nNo job id in request\n";
pub const UNSUPPORTED: &str = "252\nUnsupported\n";
pub const NODE_NOT_FOUND: &str = "253\nNode not found\n";
pub const JOB_NOT_FOUND: &str = "254\nJob not found\n";
pub const UNKNOWN_COMMAND: &str = "255\nUnknown command\n";

const REPORT_LENGTH: isize = 5;

/// Configuration a connection handler needs to run and track executors.
pub struct DaemonContext {
    pub registry: Arc<Registry>,
    pub exename: PathBuf,
    pub stats_dir: PathBuf,
    pub timeout: Duration,
    pub kill_timeout: Duration,
    pub max_stdout: usize,
    pub max_stderr: usize,
}

/// Reads exactly one framed command from `stream`, dispatches it, and
/// writes the reply, matching the original's one-command-per-connection
/// `handle`.
pub async fn handle_connection(mut stream: UnixStream, ctx: Arc<DaemonContext>) {
    match read_frame(&mut stream).await {
        Ok(frame) => {
            let reply = dispatch(&ctx, &frame.keyword, frame.body).await;
            let _ = write_frame(&mut stream, &frame.keyword, &reply).await;
        }
        Err(FrameError::Io(_)) => {}
        Err(FrameError::MalformedHeader { partial_input }) => {
            let _ = write_error(&mut stream, &partial_input).await;
        }
        Err(FrameError::ShortBody) => {
            let _ = write_error(&mut stream, b"").await;
        }
    }
}

async fn dispatch(ctx: &DaemonContext, keyword: &str, body: Vec<u8>) -> Vec<u8> {
    match keyword {
        "SPAWN" => handle_spawn(ctx, body).await,
        "RUN" => handle_run(ctx, body).await,
        "STOP" => {
            handle_stop(ctx, body).await;
            Vec::new()
        }
        "PAUSE" => handle_pause(ctx, body).await,
        "STATUS" => handle_status(ctx, body).await,
        _ => UNKNOWN_COMMAND.as_bytes().to_vec(),
    }
}

fn selector(body: &[u8]) -> (Option<String>, Option<String>) {
    extract_job_node(&String::from_utf8_lossy(body))
}

async fn write_temp_manifest(body: &[u8]) -> std::io::Result<PathBuf> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(body)?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// The five-line stats accumulator of `daemon_server.py`'s `_update_stats`:
/// the most recent complete group of [`REPORT_LENGTH`] lines in `stdout`.
/// A burst that doesn't land on a multiple of five lines can skip a whole
/// group — preserved intentionally (spec §9).
pub fn compute_stats(stdout: &[u8]) -> Vec<u8> {
    let mut lines: Vec<&[u8]> = stdout.split(|&b| b == b'\n').collect();
    if stdout.last() == Some(&b'\n') {
        lines.pop();
    }
    let total = lines.len() as isize;
    let start = (total / REPORT_LENGTH - 1) * REPORT_LENGTH;
    if start < 0 {
        return Vec::new();
    }
    let end = (total / REPORT_LENGTH) * REPORT_LENGTH;
    let mut out = Vec::new();
    for line in &lines[start as usize..end as usize] {
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out
}

/// Spawns the executor in the background, tracks it in the registry under
/// `(job, node)`, and on completion flushes its final stats to
/// `<stats_dir>/<job>/<node>`. Returns a receiver that resolves with the
/// executor's outcome, for callers (`RUN`) that need to wait on it.
async fn spawn_tracked(
    ctx: &DaemonContext,
    job: String,
    node: String,
    manifest_path: PathBuf,
) -> tokio::sync::oneshot::Receiver<ExecOutcome> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let registry = ctx.registry.clone();
    let exename = ctx.exename.clone();
    let stats_dir = ctx.stats_dir.clone();
    let timeout = ctx.timeout;
    let kill_timeout = ctx.kill_timeout;
    let max_stdout = ctx.max_stdout;
    let max_stderr = ctx.max_stderr;
    let job_for_task = job.clone();
    let node_for_task = node.clone();

    let handle = tokio::spawn(async move {
        // Mirrors `_update_stats`: every time more stdout arrives, the
        // watcher below recomputes the most recent complete five-line
        // group and publishes it, so a `STATUS` query against a
        // still-running job sees a live snapshot instead of nothing.
        let (stdout_tx, mut stdout_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let watcher_registry = registry.clone();
        let watcher_job = job_for_task.clone();
        let watcher_node = node_for_task.clone();
        let watcher = tokio::spawn(async move {
            while let Some(snapshot) = stdout_rx.recv().await {
                if let Some(record) = watcher_registry.get(&watcher_job, &watcher_node).await {
                    record.set_stats(compute_stats(&snapshot)).await;
                }
            }
        });

        let result = run_oneshot(
            &exename,
            &manifest_path,
            false,
            timeout,
            kill_timeout,
            max_stdout,
            max_stderr,
            Some(stdout_tx),
        )
        .await;
        let outcome = result.unwrap_or(ExecOutcome {
            rc: ExecRc::Error,
            stdout: Vec::new(),
            stderr: Vec::new(),
        });
        let _ = watcher.await;

        let stats = compute_stats(&outcome.stdout);
        if let Some(record) = registry.get(&job_for_task, &node_for_task).await {
            record.set_stats(stats.clone()).await;
        }
        let job_dir = stats_dir.join(&job_for_task);
        if tokio::fs::create_dir_all(&job_dir).await.is_ok() {
            let _ = tokio::fs::write(job_dir.join(&node_for_task), &stats).await;
        }

        registry.remove(&job_for_task, &node_for_task).await;
        let _ = tx.send(outcome);
    });

    ctx.registry.insert(&job, &node, handle).await;
    rx
}

async fn handle_spawn(ctx: &DaemonContext, body: Vec<u8>) -> Vec<u8> {
    let (job, node) = selector(&body);
    let Some(job) = job else {
        return NO_JOB_ID.as_bytes().to_vec();
    };
    let Some(node) = node else {
        return format!("{} 0 {}", job, NO_NODE_ID).into_bytes();
    };

    let manifest_path = match write_temp_manifest(&body).await {
        Ok(p) => p,
        Err(_) => {
            return format!("{} {} {}\n", job, node, ExecRc::Error.as_i32()).into_bytes();
        }
    };

    spawn_tracked(ctx, job.clone(), node.clone(), manifest_path).await;
    format!("{} {} {}\n", job, node, ExecRc::Ok.as_i32()).into_bytes()
}

async fn handle_run(ctx: &DaemonContext, body: Vec<u8>) -> Vec<u8> {
    let (job, node) = selector(&body);
    let Some(job) = job else {
        return NO_JOB_ID.as_bytes().to_vec();
    };
    let Some(node) = node else {
        return format!("{} 0 {}", job, NO_NODE_ID).into_bytes();
    };

    let manifest_path = match write_temp_manifest(&body).await {
        Ok(p) => p,
        Err(_) => {
            return format!("{} {} {}\n", job, node, ExecRc::Error.as_i32()).into_bytes();
        }
    };

    let rx = spawn_tracked(ctx, job.clone(), node.clone(), manifest_path).await;
    match rx.await {
        Ok(outcome) => {
            let mut reply = format!("{} {} {}\n", job, node, outcome.rc.as_i32()).into_bytes();
            reply.extend_from_slice(&outcome.stdout);
            reply
        }
        // Cancelled via STOP before it finished.
        Err(_) => format!("{} {} {}\n", job, node, ExecRc::Killed.as_i32()).into_bytes(),
    }
}

async fn handle_stop(ctx: &DaemonContext, body: Vec<u8>) {
    let (job, node) = selector(&body);
    let Some(job) = job else { return };
    for record in ctx.registry.find(&job, node.as_deref()).await {
        record.stop().await;
    }
}

async fn handle_pause(ctx: &DaemonContext, body: Vec<u8>) -> Vec<u8> {
    let (job, node) = selector(&body);
    let Some(job) = job else {
        return NO_JOB_ID.as_bytes().to_vec();
    };

    let records = ctx.registry.find(&job, node.as_deref()).await;
    if !records.is_empty() {
        let mut out = Vec::new();
        for record in &records {
            out.extend_from_slice(
                format!("{} {} {}", record.job(), record.node(), UNSUPPORTED).as_bytes(),
            );
        }
        return out;
    }
    not_found_reply(&job, node.as_deref())
}

async fn handle_status(ctx: &DaemonContext, body: Vec<u8>) -> Vec<u8> {
    let (job, node) = selector(&body);
    let Some(job) = job else {
        return NO_JOB_ID.as_bytes().to_vec();
    };

    let records = ctx.registry.find(&job, node.as_deref()).await;
    if !records.is_empty() {
        let mut out = Vec::new();
        for record in &records {
            out.extend_from_slice(format!("{} {} ", record.job(), record.node()).as_bytes());
            out.extend_from_slice(&record.stats().await);
        }
        if node.is_some() {
            return out;
        }
        append_on_disk_stats(&ctx.stats_dir, &job, &records, &mut out).await;
        return out;
    }

    if let Some(node) = &node {
        return read_stats_file(&ctx.stats_dir, &job, node)
            .await
            .unwrap_or_else(|| not_found_reply(&job, Some(node.as_str())));
    }
    format!("{} 0 {}", job, JOB_NOT_FOUND).into_bytes()
}

/// For job-wide `STATUS` with no selected node, supplements live executors'
/// stats with the on-disk stats file of any node id that isn't currently
/// tracked in memory (spec.md §10 supplement, mirroring
/// `daemon_server.py`'s `STATUS` fallback).
async fn append_on_disk_stats(
    stats_dir: &Path,
    job: &str,
    live: &[Arc<crate::daemon::registry::ExecutorRecord>],
    out: &mut Vec<u8>,
) {
    let job_dir = stats_dir.join(job);
    let Ok(mut entries) = tokio::fs::read_dir(&job_dir).await else {
        return;
    };
    let live_nodes: std::collections::HashSet<&str> = live.iter().map(|r| r.node()).collect();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let node_id = entry.file_name().to_string_lossy().into_owned();
        if live_nodes.contains(node_id.as_str()) {
            continue;
        }
        if let Ok(bytes) = tokio::fs::read(entry.path()).await {
            out.extend_from_slice(format!("{} {} ", job, node_id).as_bytes());
            out.extend_from_slice(&bytes);
        }
    }
}

async fn read_stats_file(stats_dir: &Path, job: &str, node: &str) -> Option<Vec<u8>> {
    let bytes = tokio::fs::read(stats_dir.join(job).join(node)).await.ok()?;
    let mut out = format!("{} {} ", job, node).into_bytes();
    out.extend_from_slice(&bytes);
    Some(out)
}

fn not_found_reply(job: &str, node: Option<&str>) -> Vec<u8> {
    match node {
        Some(node) => format!("{} {} {}", job, node, NODE_NOT_FOUND).into_bytes(),
        None => format!("{} 0 {}", job, JOB_NOT_FOUND).into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(exename: PathBuf, stats_dir: PathBuf) -> Arc<DaemonContext> {
        Arc::new(DaemonContext {
            registry: Arc::new(Registry::new()),
            exename,
            stats_dir,
            timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(1),
            max_stdout: 1 << 16,
            max_stderr: 1 << 16,
        })
    }

    fn script(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "#!/bin/sh\n{}", contents).unwrap();
        let mut perms = std::fs::metadata(f.path()).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(f.path(), perms).unwrap();
        f
    }

    #[test]
    fn compute_stats_keeps_most_recent_complete_group() {
        let stdout = b"a\nb\nc\nd\ne\nf\ng\nh\ni\nj\n";
        assert_eq!(compute_stats(stdout), b"f\ng\nh\ni\nj\n".to_vec());
    }

    #[test]
    fn compute_stats_empty_below_one_group() {
        assert_eq!(compute_stats(b"a\nb\nc\n"), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn spawn_missing_job_id_is_rejected() {
        let ctx = ctx(PathBuf::from("/bin/true"), std::env::temp_dir());
        let reply = handle_spawn(&ctx, b"Version = 1\n".to_vec()).await;
        assert_eq!(reply, NO_JOB_ID.as_bytes());
    }

    #[tokio::test]
    async fn spawn_missing_node_id_echoes_job() {
        let ctx = ctx(PathBuf::from("/bin/true"), std::env::temp_dir());
        let reply = handle_spawn(&ctx, b"Job = job1\n".to_vec()).await;
        assert_eq!(reply, format!("job1 0 {}", NO_NODE_ID).into_bytes());
    }

    #[tokio::test]
    async fn run_executes_synchronously_and_returns_stdout() {
        let sh = script("echo hi; exit 0");
        let stats_dir = tempfile::tempdir().unwrap();
        let ctx = ctx(sh.path().to_path_buf(), stats_dir.path().to_path_buf());

        let reply = handle_run(&ctx, b"Job = job1\nNode = 7\n".to_vec()).await;
        assert_eq!(reply, b"job1 7 0\nhi\n".to_vec());
    }

    #[tokio::test]
    async fn status_for_unknown_job_is_job_not_found() {
        let ctx = ctx(PathBuf::from("/bin/true"), std::env::temp_dir());
        let reply = handle_status(&ctx, b"Job = ghost\n".to_vec()).await;
        assert_eq!(reply, format!("ghost 0 {}", JOB_NOT_FOUND).into_bytes());
    }

    #[tokio::test]
    async fn unknown_keyword_dispatches_to_unknown_command() {
        let ctx = ctx(PathBuf::from("/bin/true"), std::env::temp_dir());
        let reply = dispatch(&ctx, "WAT", Vec::new()).await;
        assert_eq!(reply, UNKNOWN_COMMAND.as_bytes());
    }

    #[tokio::test]
    async fn pause_is_unsupported_per_matched_executor() {
        let sh = script("sleep 5");
        let stats_dir = tempfile::tempdir().unwrap();
        let ctx = ctx(sh.path().to_path_buf(), stats_dir.path().to_path_buf());

        handle_spawn(&ctx, b"Job = job1\nNode = 1\n".to_vec()).await;
        let reply = handle_pause(&ctx, b"Job = job1\nNode = 1\n".to_vec()).await;
        assert_eq!(reply, format!("job1 1 {}", UNSUPPORTED).into_bytes());

        handle_stop(&ctx, b"Job = job1\nNode = 1\n".to_vec()).await;
    }

    #[tokio::test]
    async fn status_sees_live_stats_before_executor_completes() {
        let sh = script("printf '1\\n2\\n3\\n4\\n5\\n'; sleep 1; echo done");
        let stats_dir = tempfile::tempdir().unwrap();
        let ctx = ctx(sh.path().to_path_buf(), stats_dir.path().to_path_buf());

        handle_spawn(&ctx, b"Job = job1\nNode = 1\n".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let reply = handle_status(&ctx, b"Job = job1\nNode = 1\n".to_vec()).await;
        assert_eq!(reply, b"job1 1 1\n2\n3\n4\n5\n".to_vec());

        handle_stop(&ctx, b"Job = job1\nNode = 1\n".to_vec()).await;
    }

    #[tokio::test]
    async fn malformed_header_echoes_partial_input() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut client, server) = UnixStream::pair().unwrap();
        let ctx = ctx(PathBuf::from("/bin/true"), std::env::temp_dir());

        client.write_all(b"bad-keyword 3\nfoo").await.unwrap();
        client.shutdown().await.unwrap();

        handle_connection(server, ctx).await;

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"ERROR 0\nbad-keyword 3\n".to_vec());
    }
}
