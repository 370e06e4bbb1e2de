//! Daemon socket cleanup (spec §4.10).
//!
//! Invoked when a configured daemon socket exists on disk but refuses a
//! connection: the socket's inode is correlated against the fd table of
//! every live process, and any holder whose command line names
//! `zerovm.daemon` is killed before the socket file is unlinked.
//!
//! The `/proc` scraping is isolated behind [`ProcessTable`] per the
//! "ad-hoc file-descriptor scraping" redesign note, the same way
//! `ddcommon/entity_id/unix/cgroup_inode.rs` takes its `/proc`-adjacent
//! paths as parameters rather than hardcoding them, so this can be pointed
//! at a fixture directory in tests.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("failed to read process table: {0}")]
    Io(#[from] std::io::Error),
    #[error("no process-table entry for socket {0:?}")]
    InodeNotFound(PathBuf),
}

/// The process-table operations daemon cleanup needs, isolated so a
/// non-Linux or containerized deployment can supply an equivalent.
pub trait ProcessTable {
    /// The inode backing the Unix socket at `socket_path`, per the kernel's
    /// network-sockets list (`/proc/net/unix`).
    fn socket_inode(&self, socket_path: &Path) -> Result<u64, CleanupError>;

    /// Every live pid that holds an open file descriptor on `inode`.
    fn socket_holders(&self, inode: u64) -> Result<Vec<i32>, CleanupError>;

    /// The full command line of `pid`, space-joined.
    fn command_line(&self, pid: i32) -> Result<String, CleanupError>;
}

/// A [`ProcessTable`] backed by a real (or fixture) `/proc`-shaped tree.
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    fn socket_inode(&self, socket_path: &Path) -> Result<u64, CleanupError> {
        let text = std::fs::read_to_string(self.root.join("net/unix"))?;
        let target = socket_path.to_string_lossy();
        for line in text.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // /proc/net/unix columns: Num RefCount Protocol Flags Type St Inode [Path]
            if fields.len() >= 8 && fields[7] == target {
                return fields[6]
                    .parse()
                    .map_err(|_| CleanupError::InodeNotFound(socket_path.to_path_buf()));
            }
        }
        Err(CleanupError::InodeNotFound(socket_path.to_path_buf()))
    }

    fn socket_holders(&self, inode: u64) -> Result<Vec<i32>, CleanupError> {
        let needle = format!("socket:[{}]", inode);
        let mut holders = Vec::new();

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(target) = std::fs::read_link(fd.path()) {
                    if target.to_string_lossy() == needle {
                        holders.push(pid);
                        break;
                    }
                }
            }
        }
        Ok(holders)
    }

    fn command_line(&self, pid: i32) -> Result<String, CleanupError> {
        let raw = std::fs::read(self.root.join(pid.to_string()).join("cmdline"))?;
        Ok(raw
            .split(|&b| b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect::<Vec<_>>()
            .join(" "))
    }
}

/// The command-line substring identifying a resident daemon process.
pub const DAEMON_COMMAND_MARKER: &str = "zerovm.daemon";

/// Kills every live holder of `socket_path` whose command line names the
/// daemon, then unlinks the socket file. Tolerates the socket already being
/// gone; propagates only process-table read failures.
pub fn cleanup_daemon_socket(
    table: &dyn ProcessTable,
    socket_path: &Path,
) -> Result<Vec<i32>, CleanupError> {
    let inode = table.socket_inode(socket_path)?;
    let holders = table.socket_holders(inode)?;

    let mut killed = Vec::new();
    for pid in holders {
        let command = table.command_line(pid).unwrap_or_default();
        if command.contains(DAEMON_COMMAND_MARKER) {
            if kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
                killed.push(pid);
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(killed)
}
