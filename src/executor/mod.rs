//! Sandbox execution: spawning the sandbox binary against a manifest and
//! collecting its outcome, either directly (§4.5) or via a resident daemon
//! (§4.6).

pub mod daemon_client;
pub mod oneshot;

pub use daemon_client::{run_via_daemon, DaemonClientError};
pub use oneshot::{run_oneshot, ExecOutcome, ExecRc, OneshotError};

/// Numeric status line emitted by the sandbox/daemon, matching
/// `examples/original_source/test/unit/daemon_server.py`'s `STATUS_*`
/// constants (`STATUS_STOP = 5` exists on the daemon side only, see
/// `crate::daemon`).
impl ExecRc {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExecRc::Ok),
            1 => Some(ExecRc::Error),
            2 => Some(ExecRc::Timeout),
            3 => Some(ExecRc::Killed),
            4 => Some(ExecRc::Overflow),
            _ => None,
        }
    }
}
