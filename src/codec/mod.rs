//! Framed-socket codecs (spec §4.1).
//!
//! Two line-oriented framings live here: the daemon command socket
//! (`<keyword> <len>\n<body>`) and the sandbox report socket (an 8-byte
//! ASCII hex length followed by that many bytes).

pub mod daemon_frame;
pub mod report_frame;

pub use daemon_frame::{read_frame, write_frame, Frame};
pub use report_frame::{read_report, write_report};
