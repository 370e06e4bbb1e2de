//! The resident sandbox daemon (spec §4.7): a long-lived process that
//! accepts framed commands over a Unix socket and keeps executors alive
//! across the lifetime of a job, rather than spawning-and-waiting as the
//! one-shot path (`crate::executor::oneshot`) does.
//!
//! Grounded on the teacher's `src/server.rs` for the listener-bind,
//! stale-socket-removal, and `tokio::select!`-over-signals shutdown shape,
//! generalized from a single `tonic` gRPC service to a loop that spawns
//! [`server::handle_connection`] per accepted stream.

pub mod registry;
pub mod server;

use crate::config::Config;
use anyhow::{bail, Context, Result};
use log::info;
use registry::Registry;
use server::DaemonContext;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};

pub struct Daemon {
    config: Config,
    socket_path: PathBuf,
}

impl Daemon {
    pub fn new(config: Config, socket_path: PathBuf) -> Self {
        Self {
            config,
            socket_path,
        }
    }

    /// Binds the daemon socket (removing it first if stale) and serves
    /// connections until `SIGTERM`/`SIGINT`, matching `src/server.rs`'s
    /// shutdown race.
    pub async fn start(self) -> Result<()> {
        if !self.socket_path.is_absolute() {
            bail!(
                "specified socket path {} is not absolute",
                self.socket_path.display()
            )
        }
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .await
                .with_context(|| format!("unable to remove stale socket {}", self.socket_path.display()))?;
        } else if let Some(dir) = self.socket_path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create socket dir {}", dir.display()))?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("bind daemon socket {}", self.socket_path.display()))?;
        info!("zerovm-daemon listening on {}", self.socket_path.display());

        let ctx = Arc::new(DaemonContext {
            registry: Arc::new(Registry::new()),
            exename: PathBuf::from(self.config.zerovm_exename()),
            stats_dir: self.config.stats_dir().clone(),
            timeout: Duration::from_secs(self.config.zerovm_timeout()),
            kill_timeout: Duration::from_secs(self.config.zerovm_kill_timeout()),
            max_stdout: self.config.max_stdout_bytes(),
            max_stderr: self.config.max_stderr_bytes(),
        });

        let mut shutdown_terminate = signal(SignalKind::terminate())?;
        let mut shutdown_interrupt = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted.context("accept daemon connection")?;
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        server::handle_connection(stream, ctx).await;
                    });
                }
                _ = shutdown_interrupt.recv() => {
                    info!("Got interrupt signal, shutting down daemon");
                    break;
                }
                _ = shutdown_terminate.recv() => {
                    info!("Got termination signal, shutting down daemon");
                    break;
                }
            }
        }

        let _ = fs::remove_file(&self.socket_path).await;
        Ok(())
    }
}
