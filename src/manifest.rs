//! Manifest serialization/parsing (spec §3, §6 "Manifest format").
//!
//! The manifest is a plain `Key = value` line format, ASCII-only, consumed
//! by the sandbox binary and produced by this node. Parsing is
//! case-insensitive on the attribute name and tolerant of whitespace around
//! `=`, matching `examples/original_source/test/unit/daemon_server.py`'s
//! `get_job_id`.

use crate::sysmap::{Access, ChannelSpec};
use std::fmt::Write as _;
use std::path::PathBuf;

/// One `Channel = ...` line's tuple, independent of `ChannelSpec` so the
/// manifest writer doesn't need to re-derive limits from a live channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelLine {
    pub lpath: PathBuf,
    pub dev_path: String,
    pub access: Access,
    pub etag_flag: u8,
    pub reads: u64,
    pub writes: u64,
    pub rbytes: u64,
    pub wbytes: u64,
}

impl ChannelLine {
    pub fn for_channel(channel: &ChannelSpec, lpath: PathBuf, max_iops: u64, max_input: u64, max_output: u64) -> Self {
        let etag_flag = u8::from(channel.access().contains(Access::RANDOM));
        ChannelLine {
            lpath,
            dev_path: format!("/dev/{}", channel.device()),
            access: channel.access(),
            etag_flag,
            reads: max_iops,
            writes: max_iops,
            rbytes: max_input,
            wbytes: max_output,
        }
    }

    fn to_line(&self) -> String {
        format!(
            "Channel = {}, {}, {}, {}, {}, {}, {}, {}\n",
            self.lpath.display(),
            self.dev_path,
            self.access.bits(),
            self.etag_flag,
            self.reads,
            self.writes,
            self.rbytes,
            self.wbytes
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct Manifest {
    pub version: String,
    pub program: PathBuf,
    pub timeout: u64,
    pub memory: u64,
    pub channels: Vec<ChannelLine>,
    pub job: Option<String>,
    pub node: Option<String>,
    pub name_server: Option<String>,
}

impl Manifest {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Version = {}", self.version);
        let _ = writeln!(out, "Program = {}", self.program.display());
        let _ = writeln!(out, "Timeout = {}", self.timeout);
        let _ = writeln!(out, "Memory = {}, 0", self.memory);
        for ch in &self.channels {
            out.push_str(&ch.to_line());
        }
        if let Some(ns) = &self.name_server {
            let _ = writeln!(out, "NameServer = {}", ns);
        }
        if let Some(job) = &self.job {
            let _ = writeln!(out, "Job = {}", job);
        }
        if let Some(node) = &self.node {
            let _ = writeln!(out, "Node = {}", node);
        }
        out
    }

    /// Rewrites the `Program = ` line in place (spec §4.6 daemon-restart path).
    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }
}

/// Extracts `Job = X` / `Node = Y` from raw manifest text, case-insensitive
/// on the attribute name, tolerant of whitespace around `=` (spec §4.7).
pub fn extract_job_node(manifest_text: &str) -> (Option<String>, Option<String>) {
    let mut job = None;
    let mut node = None;
    for line in manifest_text.lines() {
        let line = line.trim();
        let Some(eq) = line.find('=') else { continue };
        let attr = line[..eq].trim().to_lowercase();
        let val = line[eq + 1..].trim().to_string();
        if attr == "job" {
            job = Some(val);
        } else if attr == "node" {
            node = Some(val);
        }
        if job.is_some() && node.is_some() {
            break;
        }
    }
    (job, node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_has_required_lines_in_order() {
        let m = Manifest {
            version: "20130611".into(),
            program: PathBuf::from("/scratch/boot"),
            timeout: 5,
            memory: 536870912,
            channels: vec![ChannelLine {
                lpath: PathBuf::from("/scratch/stdout"),
                dev_path: "/dev/stdout".into(),
                access: Access::WRITABLE,
                etag_flag: 0,
                reads: 0,
                writes: 1024,
                rbytes: 0,
                wbytes: 1073741824,
            }],
            job: Some("job1".into()),
            node: Some("1".into()),
            name_server: None,
        };
        let rendered = m.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "Version = 20130611");
        assert_eq!(lines[1], "Program = /scratch/boot");
        assert_eq!(lines[2], "Timeout = 5");
        assert_eq!(lines[3], "Memory = 536870912, 0");
        assert!(lines[4].starts_with("Channel = /scratch/stdout, /dev/stdout, "));
        assert_eq!(lines[5], "Job = job1");
        assert_eq!(lines[6], "Node = 1");
    }

    #[test]
    fn extract_job_node_case_insensitive_and_whitespace_tolerant() {
        let text = "Version = 1\njob=job-42\n  Node   =   7  \n";
        let (job, node) = extract_job_node(text);
        assert_eq!(job, Some("job-42".to_string()));
        assert_eq!(node, Some("7".to_string()));
    }

    #[test]
    fn extract_job_node_missing_fields() {
        let (job, node) = extract_job_node("Version = 1\n");
        assert_eq!(job, None);
        assert_eq!(node, None);
    }

    #[test]
    fn with_program_rewrites_in_place() {
        let m = Manifest::default().with_program(PathBuf::from("/img/daemon"));
        assert_eq!(m.program, PathBuf::from("/img/daemon"));
    }
}
