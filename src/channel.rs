//! Newline-framed text channel over a byte stream.
//!
//! The same channel carries raw payload bytes during file transfers, so
//! reads go through one buffered reader and no bytes are lost between the
//! line-oriented and raw phases.

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Line terminator used on the wire.
pub const LINE_TERMINATOR: u8 = b'\n';

/// A line-oriented view of a bidirectional stream.
pub struct LineChannel<S> {
    inner: BufReader<S>,
}

impl<S> LineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Write `text` followed by a single newline.
    pub async fn send_line(&mut self, text: &str) -> io::Result<()> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(LINE_TERMINATOR);
        self.inner.write_all(&line).await?;
        self.inner.flush().await
    }

    /// Read up to the next newline or end of stream.
    ///
    /// The terminator (and a preceding `\r`) is stripped and invalid UTF-8 is
    /// replaced. An empty string means either an empty line or a closed peer.
    pub async fn recv_line(&mut self) -> io::Result<String> {
        let mut raw = Vec::new();
        self.inner.read_until(LINE_TERMINATOR, &mut raw).await?;

        if raw.last() == Some(&LINE_TERMINATOR) {
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
        }

        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Write raw payload bytes without framing.
    pub async fn send_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await
    }

    /// Read raw payload bytes; returns 0 at end of stream.
    pub async fn recv_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    /// Flush and close the write half.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
