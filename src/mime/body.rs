//! Streaming multipart body with random access to parts.
//!
//! A [`MimeBody`] reads its source exactly once, front to back. Parts are
//! discovered lazily: asking for part N stashes the bodies of every part
//! before it and parses headers until N is known. The read position is an
//! explicit state machine ([`Position`]); [`MimeBody::step`] performs the
//! only transitions that consume the stream, except for a caller reading the
//! current part destructively.
//!
//! Not for concurrent use: a body and its stash belong to one caller.

use std::collections::VecDeque;
use std::io::{self, Cursor, Read};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::boundary::{BoundaryScanner, ScanState};
use super::content_type::ContentTypeHeader;
use super::encoding::TransferEncoding;
use super::header::{MimeHeader, CONTENT_LENGTH};
use super::headers::{strip_angle, MimeHeaders};
use super::stash::StashManager;
use super::stream::PushbackSource;
use crate::config::MimeConfig;
use crate::error::{MimeError, MimeResult as Result};

/// Longest accepted `--boundary` string.
pub const MAX_BOUNDARY_LEN: usize = 4096;

type Source = PushbackSource<Box<dyn Read + Send>>;

/// Metadata for one part. Created when its headers are parsed; never removed.
#[derive(Debug, Clone)]
pub struct PartInfo {
    ordinal: usize,
    headers: MimeHeaders,
    content_type: ContentTypeHeader,
    body_read: bool,
    validated: bool,
}

impl PartInfo {
    fn new(ordinal: usize, headers: MimeHeaders) -> Self {
        Self {
            ordinal,
            content_type: headers.content_type(),
            headers,
            body_read: false,
            validated: false,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn headers(&self) -> &MimeHeaders {
        &self.headers
    }

    pub fn content_type(&self) -> &ContentTypeHeader {
        &self.content_type
    }

    pub fn content_id(&self, strip_angle_brackets: bool) -> Option<&str> {
        self.headers.content_id(strip_angle_brackets)
    }

    pub fn transfer_encoding(&self) -> TransferEncoding {
        self.headers.transfer_encoding()
    }

    /// True once the body has been consumed without being stashed.
    pub fn is_body_read(&self) -> bool {
        self.body_read
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }
}

/// Read position within the source.
#[derive(Debug, Clone)]
enum Position {
    /// Still before the first boundary (construction only).
    Preamble,
    /// A boundary was consumed; headers of this part come next.
    PartHeaders(usize),
    /// Headers of this part are parsed; its body comes next.
    PartBody(usize),
    /// Closing boundary (or end of a single-part body) consumed.
    Exhausted,
    /// A stream error occurred; it is returned by every later call.
    Errored(MimeError),
}

/// A possibly-multipart body read forward-only from a byte stream.
pub struct MimeBody {
    config: MimeConfig,
    outer_content_type: ContentTypeHeader,
    dash_boundary: Option<Vec<u8>>,
    scanner: Option<BoundaryScanner>,
    source: Source,
    stash: Box<dyn StashManager>,
    parts: Vec<PartInfo>,
    position: Position,
    validated_only: bool,
    closed: bool,
}

impl MimeBody {
    /// Open a body. For multipart content the preamble and the first
    /// part's headers are consumed before this returns.
    pub fn new(
        stash: Box<dyn StashManager>,
        content_type: ContentTypeHeader,
        source: impl Read + Send + 'static,
        config: MimeConfig,
    ) -> Result<Self> {
        let mut body = Self {
            config,
            outer_content_type: content_type,
            dash_boundary: None,
            scanner: None,
            source: PushbackSource::new(Box::new(source)),
            stash,
            parts: Vec::new(),
            position: Position::Preamble,
            validated_only: false,
            closed: false,
        };
        if body.outer_content_type.is_multipart() {
            body.open_multipart()?;
        } else {
            body.open_single_part();
        }
        if body.config.always_validate {
            body.read_and_stash_entire_message()?;
        }
        Ok(body)
    }

    fn open_single_part(&mut self) {
        let mut headers = MimeHeaders::new();
        headers.set_content_type(self.outer_content_type.clone());
        self.parts.push(PartInfo::new(0, headers));
        self.position = Position::PartBody(0);
    }

    fn open_multipart(&mut self) -> Result<()> {
        let boundary = self.outer_content_type.multipart_boundary()?;
        let mut dash_boundary = Vec::with_capacity(boundary.len() + 2);
        dash_boundary.extend_from_slice(b"--");
        dash_boundary.extend_from_slice(boundary.as_bytes());
        if dash_boundary.len() > MAX_BOUNDARY_LEN {
            return Err(MimeError::parse(format!(
                "MIME multipart boundary is longer than {MAX_BOUNDARY_LEN} bytes"
            )));
        }
        let start = match self.outer_content_type.param("start") {
            Some(s) if s.trim().is_empty() => {
                return Err(MimeError::parse(
                    "Multipart content type has an empty start parameter",
                ))
            }
            other => other.map(str::to_string),
        };

        let mut scanner = BoundaryScanner::new(&dash_boundary);
        // The first delimiter may sit at the very start of the body.
        self.source.unread(b"\r\n");
        let preamble = self.skip_preamble(&mut scanner);
        // Shorter than a delimiter line: the stream ended inside the preamble.
        let delimiter_line = dash_boundary.len() + 4;
        let at_end =
            preamble.is_err() && self.source.fill_at_least(delimiter_line)?.len() < delimiter_line;
        match preamble {
            Ok(false) => {}
            Ok(true) if self.config.lax_empty_multipart => return self.open_empty_multipart(),
            Ok(true) => return Err(MimeError::parse("Multipart message contains no parts")),
            Err(e) if self.config.lax_empty_multipart && at_end => {
                debug!(error = %e, "No boundary found in multipart body");
                return self.open_empty_multipart();
            }
            Err(e) => return Err(e),
        }

        scanner.reset();
        self.scanner = Some(scanner);
        self.dash_boundary = Some(dash_boundary);
        self.position = Position::PartHeaders(0);
        self.step()?;

        if let Some(start) = start {
            let cid = self.parts[0].content_id(false).unwrap_or_default();
            let matched = if self.config.lax_start_param {
                strip_angle(&start) == strip_angle(cid)
            } else {
                start == cid
            };
            if !matched {
                return Err(MimeError::parse(format!(
                    "Multipart content type's start parameter ({start}) does not match the Content-ID of the first part ({cid})"
                )));
            }
        }
        Ok(())
    }

    /// Returns true when the first delimiter found was the closing one.
    fn skip_preamble(&mut self, scanner: &mut BoundaryScanner) -> Result<bool> {
        let mut scratch = [0u8; 4096];
        let mut seen = 0usize;
        loop {
            let n = scanner.read(&mut self.source, &mut scratch)?;
            if n == 0 {
                break;
            }
            seen += n;
            // Two of those bytes are the CRLF pushed back above.
            if seen.saturating_sub(2) > self.config.preamble_max_size {
                return Err(MimeError::parse("Multipart message preamble too large"));
            }
        }
        Ok(matches!(scanner.state(), ScanState::Finished { last: true }))
    }

    fn open_empty_multipart(&mut self) -> Result<()> {
        warn!(
            content_type = %self.outer_content_type,
            "Multipart message has no parts, treating it as one empty part"
        );
        self.source.skip_to_end()?;
        self.open_single_part();
        self.stash.stash_bytes(0, Bytes::new())?;
        self.position = Position::Exhausted;
        Ok(())
    }

    // ── State machine ───────────────────────────────────────────────

    /// Perform one transition. Stream errors are latched.
    fn step(&mut self) -> Result<()> {
        let result = match self.position.clone() {
            Position::PartBody(n) => self.stash_current_part_body(n),
            Position::PartHeaders(n) => self.read_next_part_headers(n),
            Position::Exhausted => Ok(()),
            Position::Preamble => Err(MimeError::parse("MIME body is not positioned at a part")),
            Position::Errored(e) => Err(e),
        };
        self.latch(result)
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if !matches!(self.position, Position::Errored(_)) {
                warn!(error = %e, "MIME stream error, body is no longer usable");
                self.position = Position::Errored(e.clone());
            }
        }
        result
    }

    fn read_next_part_headers(&mut self, ordinal: usize) -> Result<()> {
        let headers = MimeHeaders::parse(&mut self.source, self.config.headers_max_size)?;
        trace!(ordinal, headers = headers.len(), "Parsed part headers");
        self.parts.push(PartInfo::new(ordinal, headers));
        self.position = Position::PartBody(ordinal);
        Ok(())
    }

    fn stash_current_part_body(&mut self, ordinal: usize) -> Result<()> {
        let limit = self.first_part_limit(ordinal);
        let mut reader = SegmentReader {
            scanner: self.scanner.as_mut(),
            source: &mut self.source,
            limit,
            seen: 0,
        };
        if self.parts[ordinal].body_read {
            // Partly consumed by a destructive reader; drop the rest.
            let skipped = io::copy(&mut reader, &mut io::sink())?;
            trace!(ordinal, skipped, "Discarded remainder of consumed part");
            self.finish_segment(ordinal);
            return Ok(());
        }
        self.stash.stash(ordinal, &mut reader)?;
        self.finish_segment(ordinal);
        self.check_content_length(ordinal)
    }

    fn finish_segment(&mut self, ordinal: usize) {
        self.position = match self.scanner.as_mut() {
            None => Position::Exhausted,
            Some(scanner) => {
                let last = matches!(scanner.state(), ScanState::Finished { last: true });
                scanner.reset();
                if last {
                    debug!(parts = ordinal + 1, "Reached closing MIME boundary");
                    Position::Exhausted
                } else {
                    Position::PartHeaders(ordinal + 1)
                }
            }
        };
    }

    fn first_part_limit(&self, ordinal: usize) -> Option<u64> {
        (ordinal == 0 && self.config.first_part_max_bytes > 0)
            .then_some(self.config.first_part_max_bytes)
    }

    /// Compare a freshly stashed body with its declared Content-Length.
    ///
    /// The first part's header often describes the whole payload rather
    /// than the part, so it is corrected instead of enforced.
    fn check_content_length(&mut self, ordinal: usize) -> Result<()> {
        let actual = self.stash.size(ordinal).unwrap_or(0);
        let part = &mut self.parts[ordinal];
        match part.headers.content_length() {
            Ok(None) => Ok(()),
            Ok(Some(declared)) if declared == actual => Ok(()),
            _ if ordinal == 0 => {
                debug!(actual, "Correcting Content-Length of first part");
                part.headers
                    .replace(MimeHeader::new(CONTENT_LENGTH, &actual.to_string()));
                Ok(())
            }
            Ok(Some(declared)) => Err(MimeError::ContentLengthMismatch {
                ordinal,
                declared,
                actual,
            }),
            Err(e) => Err(e),
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(MimeError::Closed);
        }
        if let Position::Errored(e) = &self.position {
            return Err(e.clone());
        }
        Ok(())
    }

    fn read_up_to_part(&mut self, ordinal: usize) -> Result<()> {
        self.check_usable()?;
        if ordinal > 0 && self.scanner.is_none() {
            return Err(MimeError::NoSuchPart {
                ordinal: Some(ordinal),
                content_id: None,
                reason: "There is only one part in a single-part message".to_string(),
            });
        }
        while self.parts.len() <= ordinal {
            if matches!(self.position, Position::Exhausted) {
                return Err(MimeError::NoSuchPart {
                    ordinal: Some(ordinal),
                    content_id: None,
                    reason: format!(
                        "This message does not have a part #{ordinal}; there were only {} parts",
                        self.parts.len()
                    ),
                });
            }
            self.step()?;
        }
        Ok(())
    }

    fn is_live(&self, ordinal: usize) -> bool {
        matches!(self.position, Position::PartBody(n) if n == ordinal)
            && !self.stash.peek(ordinal)
    }

    fn ensure_stashed(&mut self, ordinal: usize) -> Result<()> {
        if self.stash.peek(ordinal) {
            return Ok(());
        }
        if !self.is_live(ordinal) || self.parts[ordinal].body_read {
            return Err(MimeError::Destroyed { ordinal });
        }
        self.step()
    }

    // ── Part access ─────────────────────────────────────────────────

    /// True when the content type was multipart and the body had parts.
    pub fn is_multipart(&self) -> bool {
        self.scanner.is_some()
    }

    /// The boundary parameter (without the leading `--`).
    pub fn boundary(&self) -> Option<&str> {
        self.dash_boundary
            .as_deref()
            .and_then(|d| std::str::from_utf8(&d[2..]).ok())
    }

    pub fn outer_content_type(&self) -> &ContentTypeHeader {
        &self.outer_content_type
    }

    /// False once no part beyond the known ones can appear.
    pub fn is_more_parts_possible(&self) -> bool {
        self.is_multipart()
            && matches!(
                self.position,
                Position::PartHeaders(_) | Position::PartBody(_)
            )
    }

    pub fn known_part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn known_parts(&self) -> &[PartInfo] {
        &self.parts
    }

    /// Part 0: the first multipart part, or the whole single-part body.
    pub fn first_part(&self) -> &PartInfo {
        &self.parts[0]
    }

    /// Get a part, reading ahead and stashing earlier parts as needed.
    pub fn part(&mut self, ordinal: usize) -> Result<&PartInfo> {
        self.read_up_to_part(ordinal)?;
        Ok(&self.parts[ordinal])
    }

    /// Like [`MimeBody::part`], but a missing part is `Ok(false)`.
    pub fn has_part(&mut self, ordinal: usize) -> Result<bool> {
        match self.read_up_to_part(ordinal) {
            Ok(()) => Ok(true),
            Err(MimeError::NoSuchPart { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Find a part by Content-ID (angle brackets optional).
    ///
    /// Absence can only be established by reading the whole stream.
    pub fn part_by_content_id(&mut self, content_id: &str) -> Result<&PartInfo> {
        self.check_usable()?;
        let wanted = strip_angle(content_id).to_string();
        let mut searched = 0;
        loop {
            if let Some(found) = self.parts[searched..]
                .iter()
                .position(|p| p.content_id(true) == Some(wanted.as_str()))
            {
                return Ok(&self.parts[searched + found]);
            }
            searched = self.parts.len();
            if !self.is_more_parts_possible() {
                return Err(MimeError::NoSuchPart {
                    ordinal: None,
                    content_id: Some(wanted),
                    reason: String::new(),
                });
            }
            while self.parts.len() == searched && self.is_more_parts_possible() {
                self.step()?;
            }
        }
    }

    pub fn set_part_validated(&mut self, ordinal: usize, validated: bool) -> Result<()> {
        self.read_up_to_part(ordinal)?;
        self.parts[ordinal].validated = validated;
        Ok(())
    }

    /// Whether the body of `ordinal` can still be read.
    pub fn is_body_available(&self, ordinal: usize) -> bool {
        self.stash.peek(ordinal)
            || (self.is_live(ordinal) && self.parts.get(ordinal).is_some_and(|p| !p.body_read))
    }

    pub fn is_body_stashed(&self, ordinal: usize) -> bool {
        self.stash.peek(ordinal)
    }

    // ── Part bodies ─────────────────────────────────────────────────

    /// Open a part body.
    ///
    /// With `destroy_as_read`, the current part is streamed straight from
    /// the source and cannot be read again. Otherwise it is stashed first.
    /// Bodies are transfer-decoded unless the body was opened with
    /// `raw_parts`.
    pub fn part_input_stream(
        &mut self,
        ordinal: usize,
        destroy_as_read: bool,
    ) -> Result<Box<dyn Read + '_>> {
        self.read_up_to_part(ordinal)?;
        let encoding = self.parts[ordinal].transfer_encoding();
        let decode = !self.config.raw_parts && !encoding.is_identity();

        if destroy_as_read && !decode && self.is_live(ordinal) && !self.parts[ordinal].body_read {
            return Ok(Box::new(LivePartReader {
                limit: self.first_part_limit(ordinal),
                body: self,
                ordinal,
                seen: 0,
                finished: false,
            }));
        }

        self.ensure_stashed(ordinal)?;
        let mut raw = self.stash.recall(ordinal)?;
        if !decode {
            return Ok(raw);
        }
        let mut data = Vec::new();
        raw.read_to_end(&mut data)?;
        Ok(Box::new(Cursor::new(encoding.decode(&data)?)))
    }

    /// Whole (decoded) body of a part, without destroying it.
    pub fn part_body_bytes(&mut self, ordinal: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.part_input_stream(ordinal, false)?
            .read_to_end(&mut out)?;
        Ok(out)
    }

    /// The body as a buffer, only if it is already in memory and at most `max` bytes.
    pub fn part_bytes_if_available(&self, ordinal: usize, max: u64) -> Result<Option<Bytes>> {
        self.check_usable()?;
        let Some(part) = self.parts.get(ordinal) else {
            return Ok(None);
        };
        if !self.stash.is_byte_array_available(ordinal) {
            return Ok(None);
        }
        let raw = self.stash.recall_bytes(ordinal)?;
        let encoding = part.transfer_encoding();
        let bytes = if self.config.raw_parts || encoding.is_identity() {
            raw
        } else {
            Bytes::from(encoding.decode(&raw)?)
        };
        Ok((bytes.len() as u64 <= max).then_some(bytes))
    }

    /// Stashed size if known, else the declared Content-Length.
    pub fn part_content_length(&mut self, ordinal: usize) -> Result<Option<u64>> {
        self.read_up_to_part(ordinal)?;
        if let Some(size) = self.stash.size(ordinal) {
            return Ok(Some(size));
        }
        self.parts[ordinal].headers.content_length()
    }

    /// Size of the (encoded) body, stashing it if necessary.
    pub fn part_actual_content_length(&mut self, ordinal: usize) -> Result<u64> {
        self.read_up_to_part(ordinal)?;
        self.ensure_stashed(ordinal)?;
        match self.stash.size(ordinal) {
            Some(size) => Ok(size),
            None => self.stash.recall_bytes(ordinal).map(|b| b.len() as u64),
        }
    }

    /// Replace a part body. The bytes are encoded per the part's
    /// Content-Transfer-Encoding and its Content-Length is updated.
    pub fn set_part_body_bytes(&mut self, ordinal: usize, body: &[u8]) -> Result<()> {
        self.read_up_to_part(ordinal)?;
        if self.is_live(ordinal) {
            // Move the stream past the old body first.
            self.step()?;
        }
        let encoding = self.parts[ordinal].transfer_encoding();
        let encoded = if self.config.raw_parts {
            body.to_vec()
        } else {
            encoding.encode(body)?
        };
        let len = encoded.len();
        self.stash.stash_bytes(ordinal, Bytes::from(encoded))?;
        let part = &mut self.parts[ordinal];
        part.headers
            .replace(MimeHeader::new(CONTENT_LENGTH, &len.to_string()));
        part.body_read = false;
        Ok(())
    }

    /// Read the rest of the source, stashing every remaining part.
    pub fn read_and_stash_entire_message(&mut self) -> Result<()> {
        self.check_usable()?;
        while !matches!(self.position, Position::Exhausted) {
            self.step()?;
        }
        Ok(())
    }

    // ── Whole body ──────────────────────────────────────────────────

    /// Restrict the rebuilt body to part 0 and parts flagged validated.
    pub fn set_validated_only(&mut self, validated_only: bool) {
        self.validated_only = validated_only;
    }

    fn is_included(&self, part: &PartInfo) -> bool {
        !self.validated_only || part.ordinal == 0 || part.validated
    }

    /// The body as it would be sent on: boundaries, headers and bodies of
    /// the known parts, then any unread remainder of the source, then the
    /// closing boundary.
    ///
    /// With `destroy_as_read` unread parts are streamed from the source and
    /// the body cannot be used afterwards; otherwise everything is stashed
    /// first.
    pub fn entire_message_body(&mut self, destroy_as_read: bool) -> Result<Box<dyn Read + '_>> {
        self.check_usable()?;
        if !destroy_as_read || self.validated_only {
            self.read_and_stash_entire_message()?;
        }

        let Some(dash) = self.dash_boundary.clone() else {
            return self.part_raw_stream(0, destroy_as_read);
        };

        let live = match self.position {
            Position::PartBody(n) if !self.stash.peek(n) => Some(n),
            _ => None,
        };
        for part in &self.parts {
            if self.is_included(part) && !self.stash.peek(part.ordinal) {
                if Some(part.ordinal) != live || part.body_read {
                    return Err(MimeError::Destroyed {
                        ordinal: part.ordinal,
                    });
                }
            }
        }
        let pending = matches!(self.position, Position::PartHeaders(_));
        let remainder = live.is_some() || pending;
        if let Some(n) = live {
            self.parts[n].body_read = true;
        }

        let open = [&b"\r\n"[..], &dash, b"\r\n"].concat();
        let validated_only = self.validated_only;
        let Self {
            parts,
            stash,
            source,
            position,
            ..
        } = self;

        let mut pieces: VecDeque<Box<dyn Read + '_>> = VecDeque::new();
        for part in parts.iter() {
            if validated_only && part.ordinal > 0 && !part.validated {
                continue;
            }
            pieces.push_back(Box::new(Cursor::new(open.clone())));
            pieces.push_back(Box::new(Cursor::new(part.headers.to_bytes())));
            if Some(part.ordinal) == live {
                break;
            }
            pieces.push_back(stash.recall(part.ordinal)?);
        }
        if remainder {
            if pending {
                pieces.push_back(Box::new(Cursor::new(open)));
            }
            pieces.push_back(Box::new(source));
            *position = Position::Exhausted;
        } else {
            pieces.push_back(Box::new(Cursor::new(
                [&b"\r\n"[..], &dash, b"--\r\n"].concat(),
            )));
        }
        Ok(Box::new(ChainedReader { pieces }))
    }

    /// Length of what [`MimeBody::entire_message_body`] returns. Reads and
    /// stashes the whole source.
    pub fn entire_message_body_length(&mut self) -> Result<u64> {
        self.read_and_stash_entire_message()?;
        let Some(blen) = self.dash_boundary.as_ref().map(|d| d.len() as u64) else {
            return self.part_actual_content_length(0);
        };
        let mut total = 0u64;
        for part in &self.parts {
            if !self.is_included(part) {
                continue;
            }
            let size = self.stash.size(part.ordinal).ok_or(MimeError::Destroyed {
                ordinal: part.ordinal,
            })?;
            total += 2 + blen + 2 + part.headers.serialized_len() as u64 + size;
        }
        Ok(total + 2 + blen + 2 + 2)
    }

    fn part_raw_stream(&mut self, ordinal: usize, destroy_as_read: bool) -> Result<Box<dyn Read + '_>> {
        if destroy_as_read && self.is_live(ordinal) && !self.parts[ordinal].body_read {
            return Ok(Box::new(LivePartReader {
                limit: self.first_part_limit(ordinal),
                body: self,
                ordinal,
                seen: 0,
                finished: false,
            }));
        }
        self.ensure_stashed(ordinal)?;
        Ok(self.stash.recall(ordinal)?)
    }

    pub fn stash_manager(&self) -> &dyn StashManager {
        self.stash.as_ref()
    }

    /// Release stashed bodies. Every later call fails with `Closed`.
    pub fn close(&mut self) {
        if !self.closed {
            self.stash.close();
            self.closed = true;
        }
    }
}

/// One body segment of the source: up to the next delimiter, or to EOF
/// for a single-part body.
struct SegmentReader<'a> {
    scanner: Option<&'a mut BoundaryScanner>,
    source: &'a mut Source,
    limit: Option<u64>,
    seen: u64,
}

impl Read for SegmentReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = match self.scanner.as_deref_mut() {
            Some(scanner) => scanner.read(self.source, out).map_err(MimeError::into_io)?,
            None => self.source.read(out)?,
        };
        self.seen += n as u64;
        check_limit(self.limit, self.seen).map_err(MimeError::into_io)?;
        Ok(n)
    }
}

fn check_limit(limit: Option<u64>, seen: u64) -> Result<()> {
    match limit {
        Some(max) if seen > max => Err(MimeError::parse(format!(
            "First MIME part is larger than the maximum of {max} bytes"
        ))),
        _ => Ok(()),
    }
}

/// Destructive pass-through reader over the current part.
///
/// At the end of the body the next part's headers are parsed so the
/// [`MimeBody`] is positioned for further access.
struct LivePartReader<'a> {
    body: &'a mut MimeBody,
    ordinal: usize,
    limit: Option<u64>,
    seen: u64,
    finished: bool,
}

impl Read for LivePartReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.finished || out.is_empty() {
            return Ok(0);
        }
        let body = &mut *self.body;
        body.check_usable().map_err(MimeError::into_io)?;
        body.parts[self.ordinal].body_read = true;

        let result = match body.scanner.as_mut() {
            Some(scanner) => scanner.read(&mut body.source, out),
            None => body.source.read(out).map_err(MimeError::from),
        }
        .and_then(|n| {
            self.seen += n as u64;
            check_limit(self.limit, self.seen).map(|()| n)
        });
        let n = body.latch(result).map_err(MimeError::into_io)?;

        if n == 0 {
            self.finished = true;
            body.finish_segment(self.ordinal);
            if matches!(body.position, Position::PartHeaders(_)) {
                body.step().map_err(MimeError::into_io)?;
            }
        }
        Ok(n)
    }
}

/// Concatenation of readers, drained in order.
struct ChainedReader<'a> {
    pieces: VecDeque<Box<dyn Read + 'a>>,
}

impl Read for ChainedReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while let Some(front) = self.pieces.front_mut() {
            let n = front.read(out)?;
            if n > 0 || out.is_empty() {
                return Ok(n);
            }
            self.pieces.pop_front();
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::stash::MemoryStash;

    const MULTI: &str = "multipart/related; boundary=b; type=\"text/xml\"";

    fn open(ct: &str, body: &'static [u8], config: MimeConfig) -> Result<MimeBody> {
        MimeBody::new(
            Box::new(MemoryStash::new()),
            ContentTypeHeader::create(ct),
            body,
            config,
        )
    }

    fn three_parts() -> &'static [u8] {
        b"\r\n--b\r\nContent-Type: text/xml\r\nContent-ID: <root>\r\n\r\n<a/>\
          \r\n--b\r\nContent-ID: <two>\r\n\r\nsecond\
          \r\n--b\r\nContent-ID: <three>\r\nContent-Transfer-Encoding: base64\r\n\r\naGVsbG8=\
          \r\n--b--\r\n"
    }

    #[test]
    fn test_single_part_body() {
        let mut body = open("text/xml; charset=utf-8", b"<a/>", MimeConfig::default()).unwrap();
        assert!(!body.is_multipart());
        assert!(!body.is_more_parts_possible());
        assert!(body.first_part().content_type().is_xml());
        assert_eq!(body.part_body_bytes(0).unwrap(), b"<a/>");
        assert_eq!(body.part_content_length(0).unwrap(), Some(4));
        assert!(matches!(body.part(1), Err(MimeError::NoSuchPart { .. })));
    }

    #[test]
    fn test_random_access_stashes_earlier_parts() {
        let mut body = open(MULTI, three_parts(), MimeConfig::default()).unwrap();
        assert_eq!(body.known_part_count(), 1);
        assert_eq!(body.part(2).unwrap().content_id(true), Some("three"));
        assert!(body.is_body_stashed(0));
        assert!(body.is_body_stashed(1));
        assert_eq!(body.part_body_bytes(2).unwrap(), b"hello");
        assert_eq!(body.part_body_bytes(0).unwrap(), b"<a/>");
        assert!(!body.is_more_parts_possible());
        let err = body.part(3).unwrap_err();
        assert!(err.to_string().contains("there were only 3 parts"));
    }

    #[test]
    fn test_destructive_read_then_next_part() {
        let mut body = open(MULTI, three_parts(), MimeConfig::default()).unwrap();
        let mut first = String::new();
        body.part_input_stream(0, true)
            .unwrap()
            .read_to_string(&mut first)
            .unwrap();
        assert_eq!(first, "<a/>");
        assert!(body.first_part().is_body_read());
        assert!(!body.is_body_stashed(0));
        // Headers of the next part were parsed when the body ended.
        assert_eq!(body.known_part_count(), 2);
        assert!(matches!(
            body.part_input_stream(0, false).err(),
            Some(MimeError::Destroyed { ordinal: 0 })
        ));
        assert_eq!(body.part_body_bytes(1).unwrap(), b"second");
    }

    #[test]
    fn test_part_by_content_id() {
        let mut body = open(MULTI, three_parts(), MimeConfig::default()).unwrap();
        assert_eq!(body.part_by_content_id("two").unwrap().ordinal(), 1);
        assert_eq!(body.part_by_content_id("<three>").unwrap().ordinal(), 2);
        let err = body.part_by_content_id("missing").unwrap_err();
        assert!(matches!(err, MimeError::NoSuchPart { content_id: Some(ref c), .. } if c == "missing"));
    }

    #[test]
    fn test_start_parameter() {
        let strict = "multipart/related; boundary=b; start=root";
        let err = open(strict, three_parts(), MimeConfig::default()).err().unwrap();
        assert!(err.to_string().contains("start parameter"));

        let lax = MimeConfig {
            lax_start_param: true,
            ..MimeConfig::default()
        };
        assert!(open(strict, three_parts(), lax).is_ok());
        assert!(open("multipart/related; boundary=b; start=\"<root>\"", three_parts(), MimeConfig::default()).is_ok());
        assert!(open("multipart/related; boundary=b; start=\"\"", three_parts(), MimeConfig::default()).is_err());
    }

    #[test]
    fn test_preamble_limit() {
        let config = MimeConfig {
            preamble_max_size: 8,
            ..MimeConfig::default()
        };
        let err = open(MULTI, b"this preamble is too long\r\n--b\r\n\r\nx\r\n--b--", config)
            .err()
            .unwrap();
        assert!(err.to_string().contains("preamble too large"));
        let body = open(MULTI, b"short\r\n--b\r\n\r\nx\r\n--b--", MimeConfig::default()).unwrap();
        assert_eq!(body.known_part_count(), 1);
    }

    #[test]
    fn test_lax_empty_multipart() {
        let lax = MimeConfig {
            lax_empty_multipart: true,
            ..MimeConfig::default()
        };
        assert!(open(MULTI, b"", MimeConfig::default()).is_err());
        let mut body = open(MULTI, b"", lax.clone()).unwrap();
        assert!(!body.is_multipart());
        assert!(body.first_part().content_type().is_multipart());
        assert_eq!(body.part_body_bytes(0).unwrap(), b"");

        let mut body = open(MULTI, b"--b--\r\n", lax).unwrap();
        assert_eq!(body.part_actual_content_length(0).unwrap(), 0);
    }

    #[test]
    fn test_errors_are_latched() {
        let mut body = open(MULTI, b"\r\n--b\r\n\r\nfirst\r\n--b\r\ntruncated", MimeConfig::default())
            .unwrap();
        let first = body.part(1).unwrap_err();
        let second = body.part(0).err().unwrap();
        assert_eq!(first.to_string(), second.to_string());
        assert!(body.part_body_bytes(0).is_err());
    }

    #[test]
    fn test_content_length_checks() {
        let input: &'static [u8] = b"--b\r\nContent-Length: 99\r\n\r\nfirst\
              \r\n--b\r\nContent-Length: 3\r\n\r\nsecond\r\n--b--";
        let mut body = open(MULTI, input, MimeConfig::default()).unwrap();
        // First part: corrected, not enforced.
        assert_eq!(body.part_actual_content_length(0).unwrap(), 5);
        assert_eq!(body.first_part().headers().content_length().unwrap(), Some(5));
        let err = body.part_actual_content_length(1).unwrap_err();
        assert!(matches!(
            err,
            MimeError::ContentLengthMismatch { ordinal: 1, declared: 3, actual: 6 }
        ));
    }

    #[test]
    fn test_first_part_max_bytes() {
        let config = MimeConfig {
            first_part_max_bytes: 3,
            ..MimeConfig::default()
        };
        let mut body = open("text/plain", b"too long", config).unwrap();
        assert!(body.part_body_bytes(0).is_err());
    }

    #[test]
    fn test_set_part_body_bytes_encodes() {
        let mut body = open(MULTI, three_parts(), MimeConfig::default()).unwrap();
        body.set_part_body_bytes(2, b"bye").unwrap();
        assert_eq!(body.part_body_bytes(2).unwrap(), b"bye");
        let raw = body.part_bytes_if_available(2, 1024).unwrap();
        assert_eq!(raw.as_deref(), Some(&b"bye"[..]));
        assert_eq!(
            body.part(2).unwrap().headers().content_length().unwrap(),
            Some(4)
        );
    }

    #[test]
    fn test_entire_body_round_trip() {
        let mut body = open(MULTI, three_parts(), MimeConfig::default()).unwrap();
        let expected_len = body.entire_message_body_length().unwrap();
        let mut out = Vec::new();
        body.entire_message_body(false)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, three_parts());
        assert_eq!(expected_len, out.len() as u64);
    }

    #[test]
    fn test_entire_body_streams_the_remainder() {
        let mut body = open(MULTI, three_parts(), MimeConfig::default()).unwrap();
        body.part(1).unwrap();
        let mut out = Vec::new();
        body.entire_message_body(true)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, three_parts());
        assert!(!body.is_more_parts_possible());
    }

    #[test]
    fn test_validated_only() {
        let mut body = open(MULTI, three_parts(), MimeConfig::default()).unwrap();
        body.set_part_validated(2, true).unwrap();
        body.set_validated_only(true);
        let len = body.entire_message_body_length().unwrap();
        let mut out = Vec::new();
        body.entire_message_body(false)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.contains("<a/>"));
        assert!(!text.contains("second"));
        assert!(text.contains("aGVsbG8="));
        assert_eq!(len, out.len() as u64);
    }

    #[test]
    fn test_close() {
        let mut body = open(MULTI, three_parts(), MimeConfig::default()).unwrap();
        body.close();
        assert!(matches!(body.part(0), Err(MimeError::Closed)));
    }
}
