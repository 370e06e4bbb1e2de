//! Error handling helpers and primitives.
//!
//! [`NodeError`] carries exactly the error kinds of the request-handling
//! contract: each variant knows both its HTTP status code and the
//! `x-nexe-*` headers it should surface. Leaf components (codec, tar
//! engine, manifest parsing) stay on `anyhow::Result` and get narrowed to a
//! `NodeError` at the point a component hands control back to the
//! middleware, the same split the teacher draws between its per-subsystem
//! `thiserror` enums and its top-level `anyhow` orchestration.

use anyhow::Error;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(ThisError, Debug)]
pub enum NodeError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request too large")]
    RequestTooLarge,

    #[error("request timeout")]
    RequestTimeout,

    #[error("client disconnected")]
    ClientDisconnect,

    #[error("slot not available")]
    SlotUnavailable,

    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("execution error")]
    ExecutionError {
        /// Raw captured stdout, returned as the response body for debugging.
        stdout: Vec<u8>,
        status: String,
        retcode: i32,
    },

    #[error("internal error: {0}")]
    InternalError(String),
}

impl NodeError {
    /// HTTP status code for this error kind, per spec §7.
    pub fn status_code(&self) -> u16 {
        match self {
            NodeError::BadRequest(_) => 400,
            NodeError::RequestTooLarge => 413,
            NodeError::RequestTimeout => 408,
            NodeError::ClientDisconnect => 499,
            NodeError::SlotUnavailable => 503,
            NodeError::InsufficientStorage(_) => 507,
            NodeError::Unprocessable(_) => 422,
            NodeError::ExecutionError { .. } => 500,
            NodeError::InternalError(_) => 500,
        }
    }

    /// The `x-nexe-status` header value this error should surface, defaulting
    /// per spec §7 to "Zerovm did not run" for errors that precede execution.
    pub fn nexe_status(&self) -> String {
        match self {
            NodeError::ExecutionError { status, .. } => status.clone(),
            _ => "Zerovm did not run".to_string(),
        }
    }

    pub fn nexe_retcode(&self) -> i32 {
        match self {
            NodeError::ExecutionError { retcode, .. } => *retcode,
            _ => 0,
        }
    }

    pub fn internal(context: impl std::fmt::Display) -> Self {
        NodeError::InternalError(context.to_string())
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(e: Error) -> Self {
        NodeError::InternalError(chain(e))
    }
}

/// Renders an error stack as a colon-joined string for diagnostics / logs.
pub fn chain(res: Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn chain_joins_context_stack() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }

    #[test]
    fn status_codes_match_spec() {
        assert_eq!(NodeError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(NodeError::RequestTooLarge.status_code(), 413);
        assert_eq!(NodeError::RequestTimeout.status_code(), 408);
        assert_eq!(NodeError::ClientDisconnect.status_code(), 499);
        assert_eq!(NodeError::SlotUnavailable.status_code(), 503);
        assert_eq!(NodeError::InsufficientStorage("x".into()).status_code(), 507);
        assert_eq!(NodeError::Unprocessable("x".into()).status_code(), 422);
        assert_eq!(
            NodeError::ExecutionError {
                stdout: vec![],
                status: "x".into(),
                retcode: 1
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn default_nexe_status_when_never_ran() {
        let e = NodeError::BadRequest("bad".into());
        assert_eq!(e.nexe_status(), "Zerovm did not run");
        assert_eq!(e.nexe_retcode(), 0);
    }
}
