//! Sandbox-report socket framing: exactly 8 bytes of ASCII `0x` + 6 lowercase
//! hex digits (`"0x%06x" % n`, no trailing newline), followed by `n` bytes
//! of report text (spec §4.1).

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default overflow threshold for a report body (64 KiB, spec §4.1).
pub const DEFAULT_MAX_REPORT: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ReportFrameError {
    #[error("report error: unparseable or zero size")]
    ReportError,
    #[error("report overflow: {0} exceeds max {1}")]
    Overflow(usize, usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads the 8-byte size header and then exactly that many report bytes.
pub async fn read_report<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Vec<u8>, ReportFrameError> {
    let mut size_buf = [0u8; 8];
    reader.read_exact(&mut size_buf).await?;
    let size_str = std::str::from_utf8(&size_buf).map_err(|_| ReportFrameError::ReportError)?;
    let hex = size_str
        .strip_prefix("0x")
        .ok_or(ReportFrameError::ReportError)?;
    let n = usize::from_str_radix(hex, 16).map_err(|_| ReportFrameError::ReportError)?;
    if n == 0 {
        return Err(ReportFrameError::ReportError);
    }
    if n > max_len {
        return Err(ReportFrameError::Overflow(n, max_len));
    }

    let mut body = vec![0u8; n];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Writes the 8-byte size header followed by `body`.
pub async fn write_report<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), ReportFrameError> {
    let header = format!("0x{:06x}", body.len());
    assert_eq!(header.len(), 8, "report length header must be 8 bytes");
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
