use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::crate_name;
use zerovm_node::http::{AppState, HttpServer};
use zerovm_node::objecthandle::MemoryObjectHandle;
use zerovm_node::pool::PoolRegistry;
use zerovm_node::Config;

/// The storage-node execution middleware: serves the HTTP surface of §6,
/// owns admission pools, and drives channel staging/execution/finalize via
/// `zerovm_node::middleware`.
#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::default();

    env::set_var(
        "RUST_LOG",
        format!("{}={}", crate_name!(), config.log_level()),
    );
    env_logger::try_init().context("init env logger")?;

    let pools = PoolRegistry::new(&config.pools().context("parse zerovm-threadpools")?)
        .context("build admission pools")?;

    // The object store is an external collaborator this crate only defines
    // a boundary for (ObjectHandle); a real deployment supplies its own
    // implementation talking to the actual store. `MemoryObjectHandle`
    // stands in here so this binary is runnable on its own.
    let objects: Arc<dyn zerovm_node::objecthandle::ObjectHandle> = Arc::new(MemoryObjectHandle::new());

    let daemon_nexe = Some(std::path::PathBuf::from(config.zerovm_exename()));

    let addr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.bind_addr()))?;

    let state = Arc::new(AppState {
        config,
        pools,
        objects,
        daemon_nexe,
    });

    HttpServer::new(addr, state).serve().await
}
