//! Configuration related structures.
//!
//! Mirrors the teacher's `Config`: a `clap`-derived struct with `getset`
//! accessors and a `Default` that parses `argv`, extended with a
//! `derive_builder` builder for tests (`ConfigBuilder`) so fixtures don't
//! need to go through `argv`.

use anyhow::{anyhow, Result};
use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};

/// One entry of `zerovm_threadpools`: `name size queue`.
#[derive(Builder, Clone, Debug, Getters, CopyGetters, PartialEq, Serialize, Deserialize)]
#[builder(pattern = "owned", setter(into))]
pub struct PoolConfig {
    #[get = "pub"]
    pub name: String,
    #[get_copy = "pub"]
    pub size: usize,
    #[get_copy = "pub"]
    pub queue: usize,
}

pub const DEFAULT_POOL: &str = "default";

fn default_pools() -> Vec<PoolConfig> {
    vec![PoolConfig {
        name: DEFAULT_POOL.to_string(),
        size: 4,
        queue: 4,
    }]
}

/// Parses `zerovm_threadpools`'s `name size queue name size queue ...` grammar.
pub fn parse_pools(raw: &str) -> Result<Vec<PoolConfig>> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(default_pools());
    }
    if tokens.len() % 3 != 0 {
        return Err(anyhow!(
            "zerovm_threadpools must be triples of name/size/queue, got {} tokens",
            tokens.len()
        ));
    }
    let mut pools = Vec::with_capacity(tokens.len() / 3);
    for chunk in tokens.chunks(3) {
        let size: usize = chunk[1]
            .parse()
            .map_err(|_| anyhow!("invalid pool size {:?}", chunk[1]))?;
        let queue: usize = chunk[2]
            .parse()
            .map_err(|_| anyhow!("invalid pool queue {:?}", chunk[2]))?;
        pools.push(PoolConfig {
            name: chunk[0].to_string(),
            size,
            queue,
        });
    }
    if !pools.iter().any(|p| p.name == DEFAULT_POOL) {
        return Err(anyhow!("pool {:?} must exist", DEFAULT_POOL));
    }
    Ok(pools)
}

/// Parses `zerovm_sysimage_devices`'s `name path name path ...` grammar.
pub fn parse_sysimage_devices(raw: &str) -> Result<HashMap<String, PathBuf>> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.len() % 2 != 0 {
        return Err(anyhow!(
            "zerovm_sysimage_devices must be pairs of name/path, got {} tokens",
            tokens.len()
        ));
    }
    Ok(tokens
        .chunks(2)
        .map(|c| (c[0].to_string(), PathBuf::from(c[1])))
        .collect())
}

#[derive(Builder, Parser, CopyGetters, Getters, Serialize, Deserialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "kebab-case")]
#[clap(about = "zerovm-node - sandboxed per-object execution core")]
pub struct Config {
    #[get_copy = "pub"]
    #[clap(
        default_value("info"),
        env("ZEROVM_LOG_LEVEL"),
        long("log-level"),
        possible_values(&["trace", "debug", "info", "warn", "error", "off"]),
        value_name("LEVEL")
    )]
    /// The logging level of the application
    log_level: LevelFilter,

    #[get = "pub"]
    #[clap(
        default_value("/var/run/zerovm/daemons"),
        env("ZEROVM_SOCKETS_DIR"),
        long("sockets-dir")
    )]
    /// Directory holding resident-daemon Unix sockets.
    sockets_dir: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("/var/run/zerovm/stats"),
        env("ZEROVM_STATS_DIR"),
        long("stats-dir")
    )]
    /// Directory holding per-(job,node) flushed status reports.
    stats_dir: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("127.0.0.1:8080"),
        env("ZEROVM_BIND_ADDR"),
        long("bind-addr")
    )]
    /// Address the storage-node HTTP surface listens on.
    bind_addr: String,

    #[get = "pub"]
    #[clap(
        default_value("/var/tmp/zerovm-scratch"),
        env("ZEROVM_SCRATCH_ROOT"),
        long("scratch-root")
    )]
    /// Base directory under which per-request scratch directories are
    /// created (spec §5's cancellation cleanup unlinks the whole directory).
    scratch_root: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("zerovm"),
        env("ZEROVM_EXENAME"),
        long("zerovm-exename")
    )]
    /// Name/path of the sandbox binary when not supplied by the request.
    zerovm_exename: String,

    #[get_copy = "pub"]
    #[clap(
        default_value("1"),
        env("ZEROVM_KILL_TIMEOUT"),
        long("zerovm-kill-timeout")
    )]
    /// Grace period in seconds between TERM and KILL.
    zerovm_kill_timeout: u64,

    #[get_copy = "pub"]
    #[clap(
        default_value("5242880"),
        env("ZEROVM_MAXNEXE"),
        long("zerovm-maxnexe")
    )]
    /// Maximum size in bytes of an uploaded sandbox binary.
    zerovm_maxnexe: u64,

    #[get_copy = "pub"]
    #[clap(default_value("5"), env("ZEROVM_TIMEOUT"), long("zerovm-timeout"))]
    /// Default sandbox wall-clock timeout in seconds.
    zerovm_timeout: u64,

    #[get_copy = "pub"]
    #[clap(
        default_value("536870912"),
        env("ZEROVM_MAXNEXEMEM"),
        long("zerovm-maxnexemem")
    )]
    /// Default sandbox memory limit in bytes.
    zerovm_maxnexemem: u64,

    #[get_copy = "pub"]
    #[clap(default_value("1024"), env("ZEROVM_MAXIOPS"), long("zerovm-maxiops"))]
    /// Default per-channel max read/write operation count.
    zerovm_maxiops: u64,

    #[get_copy = "pub"]
    #[clap(
        default_value("1073741824"),
        env("ZEROVM_MAXINPUT"),
        long("zerovm-maxinput")
    )]
    /// Default per-channel max input bytes (also the ingest request cap).
    zerovm_maxinput: u64,

    #[get_copy = "pub"]
    #[clap(
        default_value("1073741824"),
        env("ZEROVM_MAXOUTPUT"),
        long("zerovm-maxoutput")
    )]
    /// Default per-channel max output bytes.
    zerovm_maxoutput: u64,

    #[get = "pub"]
    #[clap(
        default_value("20130611"),
        env("ZEROVM_MANIFEST_VER"),
        long("zerovm-manifest-ver")
    )]
    /// Manifest format version written into the `Version` line.
    zerovm_manifest_ver: String,

    #[get_copy = "pub"]
    #[clap(env("ZEROVM_DEBUG"), long("zerovm-debug"))]
    /// Enables verbose sandbox diagnostics (passed through to the manifest).
    zerovm_debug: bool,

    #[get_copy = "pub"]
    #[clap(env("ZEROVM_PERF"), long("zerovm-perf"))]
    /// Enables sandbox performance counters.
    zerovm_perf: bool,

    #[get = "pub"]
    #[clap(
        default_value(""),
        env("ZEROVM_SYSIMAGE_DEVICES"),
        long("zerovm-sysimage-devices")
    )]
    /// Raw `name path name path ...` system-image device list.
    zerovm_sysimage_devices: String,

    #[get = "pub"]
    #[clap(
        default_value(""),
        env("ZEROVM_THREADPOOLS"),
        long("zerovm-threadpools")
    )]
    /// Raw `name size queue name size queue ...` pool list.
    zerovm_threadpools: String,

    #[get_copy = "pub"]
    #[clap(env("DISABLE_FALLOCATE"), long("disable-fallocate"))]
    /// Skip `posix_fallocate` when preallocating writable channel files.
    disable_fallocate: bool,

    #[get_copy = "pub"]
    #[clap(
        default_value("64"),
        env("ZEROVM_MAX_STDOUT_KIB"),
        long("max-stdout-kib")
    )]
    /// Maximum captured sandbox stdout, in KiB (§4.1 default 64 KiB).
    max_stdout_kib: u64,

    #[get_copy = "pub"]
    #[clap(
        default_value("64"),
        env("ZEROVM_MAX_STDERR_KIB"),
        long("max-stderr-kib")
    )]
    /// Maximum captured sandbox stderr, in KiB.
    max_stderr_kib: u64,

    #[get_copy = "pub"]
    #[clap(
        default_value("300"),
        env("ZEROVM_MAX_UPLOAD_SECS"),
        long("max-upload-secs")
    )]
    /// Wall-clock budget for streaming the inbound tar body.
    max_upload_secs: u64,
}

impl Config {
    pub fn max_stdout_bytes(&self) -> usize {
        (self.max_stdout_kib() * 1024) as usize
    }

    pub fn max_stderr_bytes(&self) -> usize {
        (self.max_stderr_kib() * 1024) as usize
    }

    pub fn pools(&self) -> Result<Vec<PoolConfig>> {
        parse_pools(self.zerovm_threadpools())
    }

    pub fn sysimage_devices(&self) -> Result<HashMap<String, PathBuf>> {
        parse_sysimage_devices(self.zerovm_sysimage_devices())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse()
    }
}
