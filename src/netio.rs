//! Length-bounded line I/O shared by the SMTP and IMAP sessions. All
//! reads go through these helpers so no peer can grow a buffer without
//! limit.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite,
                AsyncWriteExt};

/// Read one CRLF (or bare LF) terminated line, terminator included.
/// Returns `None` on a clean EOF before any byte, errors out when the
/// line exceeds `max` bytes or EOF cuts a line short.
pub async fn read_line<S>(stream: &mut S, max: usize) -> Result<Option<Vec<u8>>>
where
    S: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let available = stream.fill_buf().await.context("read from peer")?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid-line");
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                line.extend_from_slice(&available[..=pos]);
                stream.consume(pos + 1);
                if line.len() > max {
                    bail!("line too long ({} bytes)", line.len());
                }
                return Ok(Some(line));
            }
            None => {
                let n = available.len();
                line.extend_from_slice(available);
                stream.consume(n);
                if line.len() > max {
                    bail!("line too long ({} bytes)", line.len());
                }
            }
        }
    }
}

/// `read_line` under a deadline; a peer idling past it is cut off.
pub async fn read_line_timeout<S>(
    stream: &mut S,
    max: usize,
    deadline: Duration,
) -> Result<Option<Vec<u8>>>
where
    S: AsyncBufRead + Unpin,
{
    tokio::time::timeout(deadline, read_line(stream, max))
        .await
        .context("peer idle past deadline")?
}

pub async fn read_exact<S>(stream: &mut S, n: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.context("read literal")?;
    Ok(buf)
}

pub async fn write_all_flush<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await.context("write to peer")?;
    stream.flush().await.context("flush to peer")?;
    Ok(())
}

/// Strip the line terminator and decode as lossy UTF-8 for the text
/// grammars.
pub fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_lines_and_eof() {
        let mut r = BufReader::new(Cursor::new(b"a\r\nbb\nccc".to_vec()));
        assert_eq!(read_line(&mut r, 100).await.unwrap().unwrap(), b"a\r\n");
        assert_eq!(read_line(&mut r, 100).await.unwrap().unwrap(), b"bb\n");
        assert!(read_line(&mut r, 100).await.is_err(), "eof mid-line");
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let mut r = BufReader::new(Cursor::new(Vec::new()));
        assert!(read_line(&mut r, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let mut r = BufReader::new(Cursor::new(vec![b'x'; 4096]));
        assert!(read_line(&mut r, 128).await.is_err());
    }

    #[test]
    fn trims_terminators() {
        assert_eq!(trim_crlf(b"abc\r\n"), b"abc");
        assert_eq!(trim_crlf(b"abc\n"), b"abc");
        assert_eq!(trim_crlf(b"abc"), b"abc");
    }
}
