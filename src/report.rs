//! Sandbox report parsing and response-builder decision (spec §4.8).
//!
//! The report is the sandbox's standard output: five `\n`-separated
//! segments (a sixth, the resident-daemon's "ready" flag, is folded into
//! the fifth by the split — see `crate::executor::daemon_client`). No
//! direct teacher analog; field names and the exact five-segment split
//! come from spec.md and `examples/original_source/test/unit/
//! daemon_server.py`'s `REPORT_LENGTH = 5`.

use crate::executor::{ExecOutcome, ExecRc};

pub const HEADER_VALIDATION: &str = "x-nexe-validation";
pub const HEADER_RETCODE: &str = "x-nexe-retcode";
pub const HEADER_ETAG: &str = "x-nexe-etag";
pub const HEADER_CDR_LINE: &str = "x-nexe-cdr-line";
pub const HEADER_STATUS: &str = "x-nexe-status";

/// The five positional fields of a successfully parsed report, already
/// collapsed/trimmed for direct use as header values (spec §4.8).
#[derive(Clone, Debug, PartialEq)]
pub struct ReportFields {
    pub validation: String,
    pub retcode: i32,
    pub etag: String,
    pub cdr_line: String,
    pub status: String,
}

impl ReportFields {
    /// Pairs of `(header name, value)` in the order spec §4.8 lists them.
    pub fn headers(&self) -> [(&'static str, String); 5] {
        [
            (HEADER_VALIDATION, self.validation.clone()),
            (HEADER_RETCODE, self.retcode.to_string()),
            (HEADER_ETAG, self.etag.clone()),
            (HEADER_CDR_LINE, self.cdr_line.clone()),
            (HEADER_STATUS, self.status.clone()),
        ]
    }
}

/// Collapses embedded newlines to spaces and trims trailing whitespace,
/// the transform spec §4.8 applies to each mapped header value.
fn normalize(field: &str) -> String {
    field.replace('\n', " ").trim_end().to_string()
}

/// Splits a report into exactly five segments on the first four `\n`s.
/// Returns `None` when the report doesn't have five segments.
pub fn parse_report(report: &[u8]) -> Option<ReportFields> {
    let text = String::from_utf8_lossy(report);
    let segments: Vec<&str> = text.splitn(5, '\n').collect();
    if segments.len() != 5 {
        return None;
    }
    segments[0].trim().parse::<i32>().ok()?;
    let retcode: i32 = segments[1].trim().parse().ok()?;
    Some(ReportFields {
        validation: normalize(segments[0]),
        retcode,
        etag: normalize(segments[2]),
        cdr_line: normalize(segments[3]),
        status: normalize(segments[4]),
    })
}

/// The response-builder's binary decision: stream a success tar, or emit
/// an execution-error response carrying the raw stdout (spec §4.8/§7).
#[derive(Debug)]
pub enum ReportDecision {
    Success(ReportFields),
    ExecutionError {
        stdout: Vec<u8>,
        status: String,
        retcode: i32,
    },
}

/// Status strings for process-level outcomes that never produced a
/// parseable report, matching scenario S2's expected
/// `x-nexe-status: Output too long`.
fn process_level_status(rc: ExecRc) -> &'static str {
    match rc {
        ExecRc::Ok => "ok",
        ExecRc::Error => "Zerovm did not run",
        ExecRc::Timeout => "Zerovm timed out",
        ExecRc::Killed => "Zerovm killed",
        ExecRc::Overflow => "Output too long",
    }
}

/// Decides between success and execution-error for a completed executor
/// run (spec §4.8: success requires `rc <= 1` AND exactly five segments).
pub fn evaluate(exec: &ExecOutcome) -> ReportDecision {
    if !matches!(exec.rc, ExecRc::Ok) {
        return ReportDecision::ExecutionError {
            stdout: exec.stdout.clone(),
            status: process_level_status(exec.rc).to_string(),
            retcode: exec.rc.as_i32(),
        };
    }

    match parse_report(&exec.stdout) {
        Some(fields) if fields.retcode <= 1 => ReportDecision::Success(fields),
        Some(fields) => ReportDecision::ExecutionError {
            stdout: exec.stdout.clone(),
            status: fields.status,
            retcode: fields.retcode,
        },
        None => ReportDecision::ExecutionError {
            stdout: exec.stdout.clone(),
            status: "Zerovm did not run".to_string(),
            retcode: 1,
        },
    }
}
