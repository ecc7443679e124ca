//! Buffered, forward-only byte source with pushback.
//!
//! Every byte the multipart engine consumes goes through a
//! [`PushbackSource`]. The buffer lets the boundary scanner look ahead
//! without ever consuming bytes past a delimiter.

use std::io::{self, BufRead, Read};

/// Size of a single refill from the underlying reader.
pub const BLOCK_SIZE: usize = 4096;

/// Buffered reader that can give bytes back.
pub struct PushbackSource<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    bytes_read: u64,
    eof: bool,
}

impl<R: Read> PushbackSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(BLOCK_SIZE),
            pos: 0,
            bytes_read: 0,
            eof: false,
        }
    }

    /// Bytes consumed so far, net of anything pushed back.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Push bytes back so the next read returns them first.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.pos >= bytes.len() {
            self.pos -= bytes.len();
            self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        } else {
            let mut joined = Vec::with_capacity(bytes.len() + self.buf.len() - self.pos);
            joined.extend_from_slice(bytes);
            joined.extend_from_slice(&self.buf[self.pos..]);
            self.buf = joined;
            self.pos = 0;
        }
        self.bytes_read = self.bytes_read.saturating_sub(bytes.len() as u64);
    }

    /// Make at least `n` bytes available, unless the reader hits EOF first.
    ///
    /// The returned slice may be shorter than `n` only at end of stream.
    pub fn fill_at_least(&mut self, n: usize) -> io::Result<&[u8]> {
        if self.buf.len() - self.pos < n && !self.eof {
            if self.pos > 0 {
                self.buf.drain(..self.pos);
                self.pos = 0;
            }
            let mut chunk = [0u8; BLOCK_SIZE];
            while self.buf.len() < n {
                let read = match self.inner.read(&mut chunk) {
                    Ok(read) => read,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                if read == 0 {
                    self.eof = true;
                    break;
                }
                self.buf.extend_from_slice(&chunk[..read]);
            }
        }
        Ok(&self.buf[self.pos..])
    }

    /// Mark `n` buffered bytes as consumed.
    pub fn consume_bytes(&mut self, n: usize) {
        BufRead::consume(self, n);
    }

    /// True once the underlying reader is drained and nothing is buffered.
    pub fn is_exhausted(&mut self) -> io::Result<bool> {
        Ok(self.fill_at_least(1)?.is_empty())
    }

    /// Read everything that is left, discarding it. Returns the byte count.
    pub fn skip_to_end(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }
}

impl<R: Read> Read for PushbackSource<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: Read> BufRead for PushbackSource<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.fill_at_least(1)
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.buf.len() - self.pos);
        self.pos += amt;
        self.bytes_read += amt as u64;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }
}
