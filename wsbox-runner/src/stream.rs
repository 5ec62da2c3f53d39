use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Result of a bounded line read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadLineResult {
    Line(Vec<u8>),
    Truncated(Vec<u8>),
    Eof,
}

/// Read one line (newline included when present) keeping at most `max_len`
/// bytes. The rest of an overlong line is consumed and dropped. A final line
/// without a trailing newline is returned as a line, not swallowed by EOF.
pub async fn read_line_with_limit<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> io::Result<ReadLineResult> {
    let mut buf = Vec::new();
    let mut truncated = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() && !truncated {
                return Ok(ReadLineResult::Eof);
            }
            return Ok(finish(buf, truncated));
        }

        let (chunk_len, found_newline) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        let room = max_len.saturating_sub(buf.len());
        let keep = chunk_len.min(room);
        buf.extend_from_slice(&available[..keep]);
        if keep < chunk_len {
            truncated = true;
        }
        reader.consume(chunk_len);

        if found_newline {
            return Ok(finish(buf, truncated));
        }
    }
}

fn finish(buf: Vec<u8>, truncated: bool) -> ReadLineResult {
    if truncated {
        ReadLineResult::Truncated(buf)
    } else {
        ReadLineResult::Line(buf)
    }
}
