//! Daemon-socket framing: exactly one header line `<keyword> <len>\n`
//! followed by `len` bytes of body.
//!
//! Grounded on the teacher's `crates/common/src/unix_stream.rs` (a thin
//! wrapper around a `tokio` socket type) for the general shape of codec
//! code in this repository, and on
//! `examples/original_source/test/unit/daemon_server.py`
//! (`parse_command`/`send_response`) for the exact wire contract.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame header")]
    MalformedHeader { partial_input: Vec<u8> },
    #[error("body shorter than declared length")]
    ShortBody,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub keyword: String,
    pub body: Vec<u8>,
}

fn is_keyword_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Parses a header line of the form `<keyword> <len>` (no trailing `\n`,
/// already stripped by the caller). Returns `None` if malformed.
fn parse_header(line: &str) -> Option<(String, usize)> {
    let mut parts = line.splitn(2, ' ');
    let keyword = parts.next()?;
    let len_str = parts.next()?;
    if keyword.is_empty() || !keyword.bytes().all(is_keyword_byte) {
        return None;
    }
    let len: usize = len_str.parse().ok()?;
    Some((keyword.to_string(), len))
}

/// Reads one line at a time (terminated by `\n`) up to `max_len` bytes,
/// without requiring the peer to use a buffered reader on their side.
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> std::io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > max_len {
            break;
        }
    }
    Ok(line)
}

/// Reads one framed command from `reader`. On a malformed header, the bytes
/// read so far (the header line, whatever was actually sent) travel with
/// `MalformedHeader` so the caller can reply with
/// `ERROR 0\n<partial-input>\n` per spec §4.1.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let header_line = read_line(reader, 256).await?;
    let header_str = String::from_utf8_lossy(&header_line);
    let (keyword, len) = match parse_header(&header_str) {
        Some(v) => v,
        None => {
            return Err(FrameError::MalformedHeader {
                partial_input: header_line,
            })
        }
    };

    let mut body = vec![0u8; len];
    if len > 0 {
        reader
            .read_exact(&mut body)
            .await
            .map_err(|_| FrameError::ShortBody)?;
    }
    Ok(Frame { keyword, body })
}

/// Writes one framed command/response: `<keyword> <len>\n<body>`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    keyword: &str,
    body: &[u8],
) -> Result<(), FrameError> {
    let header = format!("{} {}\n", keyword, body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes the `ERROR 0\n<partial-input>\n` response for a malformed header.
pub async fn write_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    partial_input: &[u8],
) -> Result<(), FrameError> {
    writer.write_all(b"ERROR 0\n").await?;
    writer.write_all(partial_input).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
