//! Boundary-terminated view over a multipart stream.
//!
//! A [`BoundaryScanner`] hands out the bytes of one body segment and stops
//! at the next delimiter (`CRLF--boundary`). After the delimiter it accepts
//! either `--` (the closing boundary) or optional transport padding followed
//! by CRLF; a delimiter followed by anything else is body data. The scanner
//! never consumes bytes past the delimiter line, so the next header block
//! (or the epilogue) is left in the source.

use std::io::Read;

use tracing::trace;

use super::stream::PushbackSource;
use crate::error::{MimeError, MimeResult as Result};

/// Where the scanner stands within the current segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Still inside the segment.
    Scanning,
    /// The delimiter was consumed; `last` is set for the closing boundary.
    Finished { last: bool },
}

/// Finds the end of each body segment in a multipart stream.
#[derive(Debug, Clone)]
pub struct BoundaryScanner {
    delimiter: Vec<u8>,
    state: ScanState,
}

impl BoundaryScanner {
    /// `dash_boundary` is `--` followed by the boundary parameter.
    pub fn new(dash_boundary: &[u8]) -> Self {
        let mut delimiter = Vec::with_capacity(dash_boundary.len() + 2);
        delimiter.extend_from_slice(b"\r\n");
        delimiter.extend_from_slice(dash_boundary);
        Self {
            delimiter,
            state: ScanState::Scanning,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Arm the scanner for the next segment.
    pub fn reset(&mut self) {
        self.state = ScanState::Scanning;
    }

    /// Read segment bytes into `out`. Returns 0 once the delimiter is consumed.
    pub fn read<R: Read>(&mut self, src: &mut PushbackSource<R>, out: &mut [u8]) -> Result<usize> {
        if matches!(self.state, ScanState::Finished { .. }) || out.is_empty() {
            return Ok(0);
        }
        let dlen = self.delimiter.len();
        let buf = src.fill_at_least(dlen + 2).map_err(MimeError::from)?;
        match find(buf, &self.delimiter) {
            Some(0) => match self.delimiter_line(src)? {
                Some((len, last)) => {
                    src.consume_bytes(len);
                    self.state = ScanState::Finished { last };
                    trace!(last, "boundary");
                    Ok(0)
                }
                None => {
                    // Delimiter text inside the body, e.g. `--boundaryX`.
                    let buf = src.fill_at_least(dlen).map_err(MimeError::from)?;
                    let n = dlen.min(buf.len()).min(out.len());
                    out[..n].copy_from_slice(&buf[..n]);
                    src.consume_bytes(n);
                    Ok(n)
                }
            },
            Some(at) => {
                let n = at.min(out.len());
                out[..n].copy_from_slice(&buf[..n]);
                src.consume_bytes(n);
                Ok(n)
            }
            None if buf.len() < dlen => Err(premature_eof()),
            None => {
                let keep = partial_suffix(buf, &self.delimiter);
                let n = (buf.len() - keep).min(out.len());
                out[..n].copy_from_slice(&buf[..n]);
                src.consume_bytes(n);
                Ok(n)
            }
        }
    }

    /// Discard the rest of the segment. Returns the number of bytes skipped.
    pub fn skip<R: Read>(&mut self, src: &mut PushbackSource<R>) -> Result<u64> {
        let mut scratch = [0u8; 4096];
        let mut skipped = 0u64;
        loop {
            let n = self.read(src, &mut scratch)?;
            if n == 0 {
                return Ok(skipped);
            }
            skipped += n as u64;
        }
    }

    /// Length of the delimiter line at the front of `src` and whether it
    /// closes the body, or `None` when the delimiter is followed by data.
    /// Nothing is consumed.
    fn delimiter_line<R: Read>(&self, src: &mut PushbackSource<R>) -> Result<Option<(usize, bool)>> {
        let dlen = self.delimiter.len();
        let mut at = dlen;
        loop {
            let buf = src.fill_at_least(at + 2).map_err(MimeError::from)?;
            let tail = &buf[at.min(buf.len())..];
            if at == dlen && tail.starts_with(b"--") {
                return Ok(Some((at + 2, true)));
            }
            if tail.starts_with(b"\r\n") {
                return Ok(Some((at + 2, false)));
            }
            match tail.first() {
                Some(b' ' | b'\t') => at += 1,
                _ if tail.len() < 2 => return Err(premature_eof()),
                _ => return Ok(None),
            }
        }
    }
}

fn premature_eof() -> MimeError {
    MimeError::parse("Unexpected end of multipart stream before the next MIME boundary")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    let first = needle[0];
    (0..=haystack.len() - needle.len())
        .find(|&i| haystack[i] == first && &haystack[i..i + needle.len()] == needle)
}

/// Length of the longest proper prefix of `needle` that ends `haystack`.
fn partial_suffix(haystack: &[u8], needle: &[u8]) -> usize {
    let max = (needle.len() - 1).min(haystack.len());
    (1..=max)
        .rev()
        .find(|&k| haystack.ends_with(&needle[..k]))
        .unwrap_or(0)
}
