//! Ordered, case-insensitive collection of MIME headers.

use std::collections::HashMap;
use std::io::{BufRead, Read, Write};
use std::sync::OnceLock;

use super::content_type::ContentTypeHeader;
use super::encoding::TransferEncoding;
use super::header::{
    MimeHeader, CONTENT_ID, CONTENT_LENGTH, CONTENT_TRANSFER_ENCODING, CONTENT_TYPE,
};
use super::stream::PushbackSource;
use crate::error::{MimeError, MimeResult as Result};

/// Headers in insertion order with a lowercase name index.
#[derive(Debug, Clone, Default)]
pub struct MimeHeaders {
    headers: Vec<MimeHeader>,
    index: HashMap<String, usize>,
    content_type: Option<ContentTypeHeader>,
    serialized_len: OnceLock<usize>,
}

impl MimeHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header. A second header with the same name is rejected.
    pub fn add(&mut self, header: MimeHeader) -> Result<()> {
        let key = header.name().to_ascii_lowercase();
        if self.index.contains_key(&key) {
            return Err(MimeError::InvalidHeader(format!(
                "duplicate header: {}",
                header.name()
            )));
        }
        self.note_content_type(&header);
        self.index.insert(key, self.headers.len());
        self.headers.push(header);
        self.serialized_len = OnceLock::new();
        Ok(())
    }

    /// Replace a header of the same name in place, or append it.
    pub fn replace(&mut self, header: MimeHeader) {
        self.note_content_type(&header);
        let key = header.name().to_ascii_lowercase();
        match self.index.get(&key) {
            Some(&at) => self.headers[at] = header,
            None => {
                self.index.insert(key, self.headers.len());
                self.headers.push(header);
            }
        }
        self.serialized_len = OnceLock::new();
    }

    /// Replace the Content-Type header.
    pub fn set_content_type(&mut self, content_type: ContentTypeHeader) {
        self.replace(content_type.header().clone());
        self.content_type = Some(content_type);
    }

    pub fn remove(&mut self, name: &str) -> Option<MimeHeader> {
        let at = self.index.remove(&name.to_ascii_lowercase())?;
        let removed = self.headers.remove(at);
        for slot in self.index.values_mut() {
            if *slot > at {
                *slot -= 1;
            }
        }
        if removed.is(CONTENT_TYPE) {
            self.content_type = None;
        }
        self.serialized_len = OnceLock::new();
        Some(removed)
    }

    pub fn get(&self, name: &str) -> Option<&MimeHeader> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&at| &self.headers[at])
    }

    pub fn has(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MimeHeader> {
        self.headers.iter()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// The Content-Type, or `text/plain; charset=US-ASCII` when absent.
    pub fn content_type(&self) -> ContentTypeHeader {
        self.content_type
            .clone()
            .unwrap_or_else(ContentTypeHeader::text_default)
    }

    /// Content-ID, optionally with surrounding angle brackets removed.
    pub fn content_id(&self, strip_angle_brackets: bool) -> Option<&str> {
        let cid = self.get(CONTENT_ID)?.main_value();
        Some(if strip_angle_brackets {
            strip_angle(cid)
        } else {
            cid
        })
    }

    /// Declared Content-Length, if any.
    pub fn content_length(&self) -> Result<Option<u64>> {
        match self.get(CONTENT_LENGTH) {
            None => Ok(None),
            Some(h) => h.main_value().trim().parse::<u64>().map(Some).map_err(|_| {
                MimeError::InvalidHeader(format!("invalid Content-Length: {}", h.full_value()))
            }),
        }
    }

    /// Content-Transfer-Encoding, 7bit when absent.
    pub fn transfer_encoding(&self) -> TransferEncoding {
        self.get(CONTENT_TRANSFER_ENCODING)
            .map(|h| TransferEncoding::from_header(h.main_value()))
            .unwrap_or(TransferEncoding::SevenBit)
    }

    /// Size of the serialized block, including the terminating blank line.
    pub fn serialized_len(&self) -> usize {
        *self
            .serialized_len
            .get_or_init(|| self.headers.iter().map(MimeHeader::serialized_len).sum::<usize>() + 2)
    }

    pub fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        for header in &self.headers {
            header.write_to(out)?;
        }
        out.write_all(b"\r\n")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        // Writing into a Vec cannot fail.
        let _ = self.write_to(&mut out);
        out
    }

    /// Read a header block up to and including its blank line.
    ///
    /// Continuation lines are unfolded. A block larger than `max_size`
    /// bytes is rejected.
    pub fn parse<R: Read>(src: &mut PushbackSource<R>, max_size: usize) -> Result<Self> {
        let mut headers = Self::new();
        let mut pending: Option<String> = None;
        let mut total = 0usize;
        let mut line = Vec::with_capacity(256);

        loop {
            line.clear();
            let budget = (max_size - total.min(max_size)) as u64 + 1;
            let n = src
                .by_ref()
                .take(budget)
                .read_until(b'\n', &mut line)
                .map_err(MimeError::from)?;
            total += n;
            if total > max_size {
                return Err(MimeError::parse("Multipart message headers too large"));
            }
            if n == 0 || line.last() != Some(&b'\n') {
                return Err(MimeError::parse(
                    "Unexpected end of stream while reading MIME part headers",
                ));
            }
            let text = decode_header_bytes(trim_eol(&line));
            if text.is_empty() {
                break;
            }
            if text.starts_with(' ') || text.starts_with('\t') {
                match pending.as_mut() {
                    Some(current) => {
                        current.push(' ');
                        current.push_str(text.trim());
                    }
                    None => {
                        return Err(MimeError::InvalidHeader(
                            "continuation line before first header".to_string(),
                        ))
                    }
                }
                continue;
            }
            if let Some(done) = pending.replace(text) {
                headers.add(MimeHeader::parse_line(&done)?)?;
            }
        }
        if let Some(done) = pending {
            headers.add(MimeHeader::parse_line(&done)?)?;
        }
        Ok(headers)
    }

    fn note_content_type(&mut self, header: &MimeHeader) {
        if header.is(CONTENT_TYPE) {
            self.content_type = Some(ContentTypeHeader::create(header.full_value()));
        }
    }
}

/// `<cid>` → `cid`; anything else unchanged.
pub fn strip_angle(value: &str) -> &str {
    let v = value.trim();
    v.strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(v)
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Header bytes as text: UTF-8 when valid, windows-1252 otherwise.
fn decode_header_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}
