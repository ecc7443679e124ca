//! Single MIME header with lazily parsed parameters.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::OnceLock;

use tracing::debug;

use crate::error::{MimeError, MimeResult as Result};

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_ID: &str = "Content-ID";
pub const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";

/// One `Name: value` header.
///
/// The main value (text before the first unquoted `;`) is split off
/// eagerly. The parameter list is only parsed the first time it is asked
/// for, and the result is then fixed for the life of the header.
#[derive(Debug, Clone)]
pub struct MimeHeader {
    name: String,
    main_value: String,
    full_value: String,
    params_at: Option<usize>,
    params: OnceLock<BTreeMap<String, String>>,
}

impl MimeHeader {
    /// Build a header from its name and raw value (text after the colon).
    pub fn new(name: impl Into<String>, value: &str) -> Self {
        let full_value = value.trim().to_string();
        let params_at = find_unquoted(&full_value, b';');
        let main_value = match params_at {
            Some(at) => full_value[..at].trim_end().to_string(),
            None => full_value.clone(),
        };
        Self {
            name: name.into(),
            main_value,
            full_value,
            params_at,
            params: OnceLock::new(),
        }
    }

    /// Build a header from a main value and explicit parameters.
    ///
    /// Parameter values are quoted when they are not plain tokens.
    pub fn with_params<'a>(
        name: impl Into<String>,
        main_value: &str,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut full_value = main_value.to_string();
        let mut map = BTreeMap::new();
        for (k, v) in params {
            full_value.push_str("; ");
            full_value.push_str(k);
            full_value.push('=');
            full_value.push_str(&quote_if_needed(v));
            map.insert(k.to_ascii_lowercase(), v.to_string());
        }
        let params = OnceLock::new();
        let _ = params.set(map);
        Self {
            name: name.into(),
            main_value: main_value.to_string(),
            params_at: (full_value.len() > main_value.len()).then_some(main_value.len()),
            full_value,
            params,
        }
    }

    /// Parse a complete `Name: value` line (already unfolded).
    pub fn parse_line(line: &str) -> Result<Self> {
        let colon = line
            .find(':')
            .ok_or_else(|| MimeError::InvalidHeader(format!("no colon in header line: {line}")))?;
        let name = line[..colon].trim();
        if name.is_empty() || !name.bytes().all(is_header_name_char) {
            return Err(MimeError::InvalidHeader(format!("bad header name: {name:?}")));
        }
        Ok(Self::new(name, &line[colon + 1..]))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn main_value(&self) -> &str {
        &self.main_value
    }

    /// The value exactly as it will be serialized.
    pub fn full_value(&self) -> &str {
        &self.full_value
    }

    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Parameters, parsed on first access. Malformed lists yield an empty map.
    pub fn params(&self) -> &BTreeMap<String, String> {
        self.params.get_or_init(|| match self.parse_params() {
            Ok(map) => map,
            Err(e) => {
                debug!(header = %self.name, error = %e, "Ignoring malformed header parameters");
                BTreeMap::new()
            }
        })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params()
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Strict parse of the parameter list.
    pub fn validate(&self) -> Result<()> {
        self.parse_params().map(|_| ())
    }

    fn parse_params(&self) -> Result<BTreeMap<String, String>> {
        match self.params_at {
            Some(at) => parse_param_list(&self.full_value[at..]),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Bytes written by [`MimeHeader::write_to`].
    pub fn serialized_len(&self) -> usize {
        self.name.len() + 2 + self.full_value.len() + 2
    }

    pub fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(self.name.as_bytes())?;
        out.write_all(b": ")?;
        out.write_all(self.full_value.as_bytes())?;
        out.write_all(b"\r\n")
    }
}

impl std::fmt::Display for MimeHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.full_value)
    }
}

/// Parse `; name=value; name="quoted"` into a lowercase-keyed map.
pub(crate) fn parse_param_list(text: &str) -> Result<BTreeMap<String, String>> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut map = BTreeMap::new();
    let mut pos = 0;

    while pos < len {
        while pos < len && (bytes[pos] == b';' || bytes[pos].is_ascii_whitespace()) {
            pos += 1;
        }
        if pos >= len {
            break;
        }
        let start = pos;
        while pos < len && is_token_char(bytes[pos]) {
            pos += 1;
        }
        let name = &text[start..pos];
        while pos < len && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if name.is_empty() || pos >= len || bytes[pos] != b'=' {
            return Err(MimeError::InvalidHeader(format!(
                "expected name=value parameter at: {}",
                &text[start..]
            )));
        }
        pos += 1;
        while pos < len && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }

        let value = if pos < len && bytes[pos] == b'"' {
            pos += 1;
            let mut v = Vec::new();
            let mut closed = false;
            while pos < len {
                match bytes[pos] {
                    b'\\' if pos + 1 < len => {
                        v.push(bytes[pos + 1]);
                        pos += 2;
                    }
                    b'"' => {
                        pos += 1;
                        closed = true;
                        break;
                    }
                    c => {
                        v.push(c);
                        pos += 1;
                    }
                }
            }
            if !closed {
                return Err(MimeError::InvalidHeader(format!(
                    "unterminated quoted value for parameter {name}"
                )));
            }
            String::from_utf8_lossy(&v).into_owned()
        } else {
            let vstart = pos;
            while pos < len && is_token_char(bytes[pos]) {
                pos += 1;
            }
            if vstart == pos {
                return Err(MimeError::InvalidHeader(format!(
                    "missing value for parameter {name}"
                )));
            }
            text[vstart..pos].to_string()
        };

        while pos < len && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos < len && bytes[pos] != b';' {
            return Err(MimeError::InvalidHeader(format!(
                "unexpected text after parameter {name}: {}",
                &text[pos..]
            )));
        }
        map.insert(name.to_ascii_lowercase(), value);
    }
    Ok(map)
}

/// Index of the first `needle` outside a quoted string.
pub(crate) fn find_unquoted(text: &str, needle: u8) -> Option<usize> {
    let mut quoted = false;
    let mut escaped = false;
    for (i, &b) in text.as_bytes().iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if quoted => escaped = true,
            b'"' => quoted = !quoted,
            _ if b == needle && !quoted => return Some(i),
            _ => {}
        }
    }
    None
}

/// RFC 2045 token character.
#[inline]
pub(crate) fn is_token_char(c: u8) -> bool {
    matches!(c,
        b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z' |
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'{' | b'|' | b'}' | b'~'
    )
}

pub(crate) fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_token_char)
}

fn is_header_name_char(c: u8) -> bool {
    c.is_ascii_graphic() && c != b':'
}

fn quote_if_needed(value: &str) -> String {
    if is_token(value) {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
