use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::crate_name;
use zerovm_node::daemon::Daemon;
use zerovm_node::Config;

/// Resident per-node sandbox daemon: accepts one framed command per
/// connection on a Unix socket under `--sockets-dir`, named after the node
/// id it serves.
#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::default();

    env::set_var(
        "RUST_LOG",
        format!("{}={}", crate_name!(), config.log_level()),
    );
    env_logger::try_init().context("init env logger")?;

    let node_id = env::var("ZEROVM_NODE_ID").context("ZEROVM_NODE_ID must name this daemon's node id")?;
    if node_id.is_empty() {
        bail!("ZEROVM_NODE_ID must not be empty");
    }

    let socket_path: PathBuf = config.sockets_dir().join(&node_id);
    Daemon::new(config, socket_path).start().await
}
