//! Newline framing for the async transports
//!
//! One protocol message per line. Reads are bounded by [`MAX_LINE_LEN`] so a
//! misbehaving peer cannot grow the buffer without limit.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::MAX_LINE_LEN;

#[derive(Error, Debug)]
pub enum LineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds {0} bytes")]
    TooLong(usize),

    #[error("line is not valid UTF-8")]
    Utf8,
}

/// Reads one newline-terminated line, without the terminator.
///
/// Returns `Ok(None)` on a clean EOF or when the peer disconnects mid-line.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, LineError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut bounded = AsyncReadExt::take(&mut *reader, MAX_LINE_LEN as u64 + 1);
    let n = bounded.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE_LEN {
            return Err(LineError::TooLong(MAX_LINE_LEN));
        }
        // peer went away mid-line
        return Ok(None);
    }
    buf.pop();
    String::from_utf8(buf).map(Some).map_err(|_| LineError::Utf8)
}

/// Writes `line` followed by a newline and flushes.
pub async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(!line.contains('\n'));
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
