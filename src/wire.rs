//! Framed byte-stream I/O: "read until CRLFCRLF", "read exactly N bytes",
//! "read chunked body", and the bidirectional relay used by CONNECT (spec
//! §4.1, §4.3).

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

/// The header-block size cap from spec §4.1: 64 KiB without finding the
/// `\r\n\r\n` terminator is a `MALFORMED` parse failure.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// A byte stream with a small pushback buffer, so that bytes read past a
/// header block's terminator (the start of the body) aren't lost between
/// the "find CRLFCRLF" phase and the "read the body" phase.
pub struct Wire<S> {
    stream: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Wire<S> {
    /// Wraps a stream with an empty pushback buffer.
    pub fn new(stream: S) -> Self {
        Self { stream, buf: Vec::new(), pos: 0 }
    }

    /// Reads bytes into the internal buffer until `\r\n\r\n` is found,
    /// returning everything up to and including the terminator. Fails with
    /// `Malformed` if [`MAX_HEADER_BYTES`] is exceeded first, or `PeerClosed`
    /// if the connection ends first.
    pub async fn read_head(&mut self) -> Result<Vec<u8>> {
        let mut scan_from = self.pos;
        loop {
            if let Some(rel) = find_subslice(&self.buf[scan_from..], b"\r\n\r\n") {
                let end = scan_from + rel + 4;
                let head = self.buf[self.pos..end].to_vec();
                self.pos = end;
                return Ok(head);
            }
            scan_from = self.buf.len().saturating_sub(3).max(self.pos);
            if self.buf.len() - self.pos > MAX_HEADER_BYTES {
                return Err(ProxyError::malformed(
                    "header block exceeds 64 KiB without CRLFCRLF",
                ));
            }
            let n = self.fill().await?;
            if n == 0 {
                return Err(ProxyError::PeerClosed);
            }
        }
    }

    /// Reads exactly `n` bytes, drawing first from the pushback buffer.
    pub async fn read_exact_n(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.buf.len() - self.pos < n {
            let got = self.fill().await?;
            if got == 0 {
                return Err(ProxyError::PeerClosed);
            }
        }
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        self.compact();
        Ok(out)
    }

    /// Reads a single CRLF-terminated line, returning its text content
    /// (without the CRLF) and the exact bytes consumed (with the CRLF), so
    /// callers that need byte-exact retention (e.g. `raw`) don't have to
    /// re-derive the wire form from the parsed text.
    pub async fn read_line_raw(&mut self) -> Result<(String, Vec<u8>)> {
        loop {
            if let Some(rel) = find_subslice(&self.buf[self.pos..], b"\r\n") {
                let raw = self.buf[self.pos..self.pos + rel + 2].to_vec();
                let text = self.buf[self.pos..self.pos + rel].to_vec();
                self.pos += rel + 2;
                self.compact();
                return Ok((String::from_utf8_lossy(&text).into_owned(), raw));
            }
            let n = self.fill().await?;
            if n == 0 {
                return Err(ProxyError::PeerClosed);
            }
        }
    }

    /// Reads a single CRLF-terminated line (without the CRLF).
    pub async fn read_line(&mut self) -> Result<String> {
        Ok(self.read_line_raw().await?.0)
    }

    /// Decodes a chunked body (spec §4.1 step 4): repeated `size\r\n data
    /// \r\n` chunks terminated by a zero-size chunk, trailers discarded.
    /// Returns the decoded body and the exact bytes consumed off the wire,
    /// so the caller can retain both the logical body and the original
    /// `raw` framing (spec §3).
    pub async fn read_chunked(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut body = Vec::new();
        let mut raw = Vec::new();
        loop {
            let (size_line, size_line_raw) = self.read_line_raw().await?;
            raw.extend_from_slice(&size_line_raw);
            let size_token = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_token, 16).map_err(|_| {
                ProxyError::malformed(format!(
                    "invalid chunk size line: {size_line:?}"
                ))
            })?;
            if size == 0 {
                // Drain trailer headers up to the empty line.
                loop {
                    let (line, line_raw) = self.read_line_raw().await?;
                    raw.extend_from_slice(&line_raw);
                    if line.is_empty() {
                        break;
                    }
                }
                return Ok((body, raw));
            }
            let chunk = self.read_exact_n(size).await?;
            raw.extend_from_slice(&chunk);
            body.extend_from_slice(&chunk);
            let crlf = self.read_exact_n(2).await?;
            raw.extend_from_slice(&crlf);
            if crlf != b"\r\n" {
                return Err(ProxyError::malformed(
                    "missing CRLF after chunk data",
                ));
            }
        }
    }

    /// Reads until the connection is closed by the peer (used for response
    /// bodies with neither `Content-Length` nor chunked framing).
    pub async fn read_to_close(&mut self) -> Result<Vec<u8>> {
        loop {
            let n = self.fill().await?;
            if n == 0 {
                let out = self.buf[self.pos..].to_vec();
                self.pos = self.buf.len();
                return Ok(out);
            }
        }
    }

    /// Writes `data` to the stream in full.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Splits the wire back into its raw stream and any buffered-but-unread
    /// bytes, for handing off to CONNECT tunneling.
    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Borrows the underlying stream directly, bypassing the pushback
    /// buffer. Used for CONNECT tunneling, where the request has no body
    /// and so nothing is left buffered after `read_head`.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    async fn fill(&mut self) -> Result<usize> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn compact(&mut self) {
        if self.pos > 0 && self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Wraps a future with the configured idle-socket timeout (spec §5),
/// converting an elapsed timeout into [`ProxyError::IoTimeout`].
pub async fn with_timeout<T>(
    dur: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(dur, fut).await?
}

/// Relays bytes bidirectionally between `client` and `origin` until either
/// side closes or errors (spec §4.3 CONNECT tunneling). The proxy never
/// inspects the bytes it relays.
pub async fn relay_bidirectional<A, B>(client: &mut A, origin: &mut B) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::io::copy_bidirectional(client, origin).await.map_err(ProxyError::from)?;
    Ok(())
}
