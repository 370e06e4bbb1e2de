//! Writable-channel finalizer (spec §4.9).
//!
//! No direct teacher analog; grounded on the teacher's `md5` usage pattern
//! retrieved from `DataDog-libdatadog/datadog-ffe/src/rules_based/
//! sharder.rs` (`md5::compute`, `{:x}` hex formatting) and on
//! `src/objecthandle.rs`'s capability boundary for the atomic publish step.

use crate::error::NodeError;
use crate::objecthandle::{ObjectHandle, PublishMetadata};
use crate::sysmap::{Access, ChannelSpec};
use std::collections::HashMap;
use std::path::PathBuf;

/// A parsed CGI/HTTP response preamble (spec §3/§4.9 step 2).
#[derive(Debug, PartialEq)]
pub struct CgiPreamble {
    /// Byte offset of the body, past the blank line terminating headers.
    pub offset: usize,
    pub content_type: Option<String>,
    pub object_meta: HashMap<String, String>,
}

/// Locates the blank line separating CGI/HTTP headers from the body and
/// projects `Content-Type` and `x-object-meta-*` headers. Accepts both
/// `\r\n\r\n` and bare `\n\n` separators.
pub fn parse_cgi_preamble(bytes: &[u8]) -> Option<CgiPreamble> {
    let sep_len;
    let header_end = if let Some(pos) = find_subslice(bytes, b"\r\n\r\n") {
        sep_len = 4;
        pos
    } else {
        sep_len = 2;
        find_subslice(bytes, b"\n\n")?
    };

    let header_text = String::from_utf8_lossy(&bytes[..header_end]);
    let mut lines = header_text.split(['\r', '\n']).filter(|l| !l.is_empty());
    lines.next(); // status line, e.g. "HTTP/1.1 200 OK"

    let mut content_type = None;
    let mut object_meta = HashMap::new();
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim().to_string();
        if key == "content-type" {
            content_type = Some(value);
        } else if let Some(meta_key) = key.strip_prefix("x-object-meta-") {
            object_meta.insert(meta_key.to_string(), value);
        }
    }

    Some(CgiPreamble {
        offset: header_end + sep_len,
        content_type,
        object_meta,
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Selects the final etag from the report's `x-nexe-etag` field (spec §4.9
/// step 1): either `dev etag dev etag ...` pairs (first token starts with
/// `/`) or `memhash dev etag ...` (first token is the selected hash).
fn select_etag(report_etag: &str, device: &str) -> Result<String, NodeError> {
    let tokens: Vec<&str> = report_etag.split_whitespace().collect();
    let first = tokens
        .first()
        .ok_or_else(|| NodeError::Unprocessable("missing etag in report".to_string()))?;

    let selected = if first.starts_with('/') {
        let dev_path = format!("/dev/{}", device);
        tokens
            .chunks(2)
            .find(|pair| pair.len() == 2 && pair[0] == dev_path)
            .map(|pair| pair[1].to_string())
            .ok_or_else(|| {
                NodeError::Unprocessable(format!("no etag reported for device {:?}", device))
            })?
    } else {
        first.to_string()
    };

    validate_hex_etag(&selected)?;
    Ok(selected)
}

fn validate_hex_etag(etag: &str) -> Result<(), NodeError> {
    if etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(NodeError::Unprocessable(format!(
            "malformed etag {:?}",
            etag
        )))
    }
}

/// Finalizes the at-most-one WRITABLE channel that represents the
/// request's target object (spec §4.9). Publishes via `objects` and
/// returns the final etag.
pub async fn finalize_writable_channel(
    objects: &dyn ObjectHandle,
    channel: &ChannelSpec,
    report_etag: &str,
    timestamp: &str,
    target_url: &str,
) -> Result<String, NodeError> {
    let lpath = channel
        .lpath()
        .clone()
        .ok_or_else(|| NodeError::internal("writable channel missing a staged file"))?;

    let mut etag = select_etag(report_etag, channel.device())?;
    let mut content_type = channel.content_type().to_string();
    let mut object_meta = HashMap::new();
    let mut publish_path: PathBuf = lpath.clone();

    if channel.is_cgi() {
        let bytes = tokio::fs::read(&lpath)
            .await
            .map_err(NodeError::internal)?;
        let preamble = parse_cgi_preamble(&bytes)
            .ok_or_else(|| NodeError::Unprocessable("missing CGI/HTTP preamble".to_string()))?;
        let body = &bytes[preamble.offset..];
        etag = format!("{:x}", md5::compute(body));
        if let Some(ct) = preamble.content_type {
            content_type = ct;
        }
        object_meta = preamble.object_meta;

        let rewritten = tempfile::NamedTempFile::new().map_err(NodeError::internal)?;
        tokio::fs::write(rewritten.path(), body)
            .await
            .map_err(NodeError::internal)?;
        let (_, path) = rewritten.keep().map_err(|e| NodeError::internal(e.error))?;
        publish_path = path;
    } else if channel.access().contains(Access::RANDOM) {
        let bytes = tokio::fs::read(&lpath)
            .await
            .map_err(NodeError::internal)?;
        etag = format!("{:x}", md5::compute(&bytes));
    }

    let content_length = tokio::fs::metadata(&publish_path)
        .await
        .map_err(NodeError::internal)?
        .len();

    let metadata = PublishMetadata {
        timestamp: timestamp.to_string(),
        content_type,
        content_length,
        etag: etag.clone(),
        object_meta,
    };

    objects
        .create_with_metadata(target_url, &publish_path, metadata)
        .await
        .map_err(NodeError::internal)?;

    log::debug!(
        "published {} at timestamp {} with etag {}",
        target_url,
        timestamp,
        etag
    );

    Ok(etag)
}
