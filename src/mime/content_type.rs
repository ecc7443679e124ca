//! Content-Type header: media type classification, boundary and charset.

use encoding_rs::Encoding;
use tracing::{debug, warn};

use super::header::{find_unquoted, is_token, parse_param_list, MimeHeader, CONTENT_TYPE};
use crate::config::MimeConfig;
use crate::error::{MimeError, MimeResult as Result};

/// Type used for values that could not be parsed.
pub const INVALID_TYPE: (&str, &str) = ("application", "x-invalid-content-type");

/// How charset names are turned into encodings.
#[derive(Debug, Clone, Copy)]
pub struct CharsetPolicy {
    /// Used when no charset is given, and for unknown ones unless `strict`.
    pub default: &'static Encoding,
    pub strict: bool,
}

impl CharsetPolicy {
    pub fn from_config(config: &MimeConfig) -> Self {
        let default = Encoding::for_label(config.default_charset.as_bytes()).unwrap_or_else(|| {
            warn!(
                charset = %config.default_charset,
                "Unknown default charset, using windows-1252"
            );
            encoding_rs::WINDOWS_1252
        });
        Self {
            default,
            strict: config.strict_charset,
        }
    }
}

impl Default for CharsetPolicy {
    fn default() -> Self {
        Self::from_config(&MimeConfig::default())
    }
}

/// A parsed `Content-Type` header.
///
/// Type and subtype are always lowercase.
#[derive(Debug, Clone)]
pub struct ContentTypeHeader {
    header: MimeHeader,
    media_type: String,
    subtype: String,
    /// The rejected value, when [`ContentTypeHeader::create`] fell back.
    original: Option<String>,
}

impl ContentTypeHeader {
    /// Parse leniently: malformed values become `application/x-invalid-content-type`.
    pub fn create(value: &str) -> Self {
        match Self::parse_value(value) {
            Ok(ct) => ct,
            Err(e) => {
                debug!(value, error = %e, "Unparseable Content-Type");
                let mut ct = Self::new(INVALID_TYPE.0, INVALID_TYPE.1, []);
                ct.original = Some(value.to_string());
                ct
            }
        }
    }

    /// Parse strictly.
    pub fn parse_value(value: &str) -> Result<Self> {
        let value = value.trim();
        let main_end = find_unquoted(value, b';').unwrap_or(value.len());
        let main = value[..main_end].trim();
        let (media_type, subtype) = main
            .split_once('/')
            .map(|(t, s)| (t.trim(), s.trim()))
            .filter(|(t, s)| is_token(t) && is_token(s))
            .ok_or_else(|| MimeError::InvalidContentType(value.to_string()))?;

        parse_param_list(&value[main_end..])
            .map_err(|e| MimeError::InvalidContentType(format!("{value}: {e}")))?;

        let ct = Self {
            header: MimeHeader::new(CONTENT_TYPE, value),
            media_type: media_type.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            original: None,
        };
        if ct.is_multipart() {
            ct.multipart_boundary()?;
        }
        Ok(ct)
    }

    /// Build from parts. Never fails; the boundary is not validated.
    pub fn new<'a>(
        media_type: &str,
        subtype: &str,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let media_type = media_type.to_ascii_lowercase();
        let subtype = subtype.to_ascii_lowercase();
        let main = format!("{media_type}/{subtype}");
        Self {
            header: MimeHeader::with_params(CONTENT_TYPE, &main, params),
            media_type,
            subtype,
            original: None,
        }
    }

    /// `text/plain; charset=US-ASCII`, the RFC 2045 default.
    pub fn text_default() -> Self {
        Self::new("text", "plain", [("charset", "US-ASCII")])
    }

    /// `text/xml; charset=utf-8`
    pub fn xml_default() -> Self {
        Self::new("text", "xml", [("charset", "utf-8")])
    }

    /// `application/octet-stream`
    pub fn octet_stream_default() -> Self {
        Self::new("application", "octet-stream", [])
    }

    pub fn header(&self) -> &MimeHeader {
        &self.header
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// `type/subtype`
    pub fn main_value(&self) -> String {
        format!("{}/{}", self.media_type, self.subtype)
    }

    pub fn full_value(&self) -> &str {
        self.header.full_value()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.header.param(name)
    }

    /// Type/subtype match, `*` matching anything.
    pub fn matches(&self, media_type: &str, subtype: &str) -> bool {
        (media_type == "*" || self.media_type.eq_ignore_ascii_case(media_type))
            && (subtype == "*" || self.subtype.eq_ignore_ascii_case(subtype))
    }

    pub fn is_multipart(&self) -> bool {
        self.media_type == "multipart"
    }

    pub fn is_text(&self) -> bool {
        self.media_type == "text"
    }

    pub fn is_html(&self) -> bool {
        self.matches("text", "html")
    }

    pub fn is_xml(&self) -> bool {
        self.matches("text", "xml")
            || self.matches("application", "xml")
            || self.subtype.ends_with("+xml")
    }

    pub fn is_soap12(&self) -> bool {
        self.matches("application", "soap+xml")
    }

    pub fn is_json(&self) -> bool {
        self.matches("application", "json") || self.subtype.ends_with("+json")
    }

    pub fn is_application_form_urlencoded(&self) -> bool {
        self.matches("application", "x-www-form-urlencoded")
    }

    /// The unparseable header value this fallback stands in for.
    pub fn original_value(&self) -> Option<&str> {
        self.original.as_deref()
    }

    pub fn is_invalid(&self) -> bool {
        self.matches(INVALID_TYPE.0, INVALID_TYPE.1)
    }

    /// The multipart boundary, validated to be non-empty printable ASCII.
    pub fn multipart_boundary(&self) -> Result<&str> {
        if !self.is_multipart() {
            return Err(MimeError::InvalidContentType(format!(
                "{} is not a multipart type",
                self.main_value()
            )));
        }
        let boundary = self.param("boundary").ok_or_else(|| {
            MimeError::InvalidContentType("multipart content type has no boundary".to_string())
        })?;
        if boundary.is_empty() {
            return Err(MimeError::InvalidContentType(
                "multipart boundary is empty".to_string(),
            ));
        }
        if !boundary.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
            return Err(MimeError::InvalidContentType(
                "multipart boundary contains non-printable characters".to_string(),
            ));
        }
        Ok(boundary)
    }

    /// Encoding named by the `charset` parameter.
    ///
    /// Missing charsets use the policy default. Unknown ones do too, unless
    /// the policy is strict.
    pub fn encoding(&self, policy: &CharsetPolicy) -> Result<&'static Encoding> {
        let Some(charset) = self.param("charset") else {
            return Ok(policy.default);
        };
        match Encoding::for_label(charset.trim().as_bytes()) {
            Some(encoding) => Ok(encoding),
            None if policy.strict => Err(MimeError::UnsupportedEncoding(charset.to_string())),
            None => {
                warn!(
                    charset,
                    default = policy.default.name(),
                    "Unknown charset, using default"
                );
                Ok(policy.default)
            }
        }
    }
}

impl std::fmt::Display for ContentTypeHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.full_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_and_subtype_are_lowercased() {
        let ct = ContentTypeHeader::parse_value("Text/XML; Charset=UTF-8").unwrap();
        assert_eq!(ct.media_type(), "text");
        assert_eq!(ct.subtype(), "xml");
        assert!(ct.is_xml());
        assert!(ct.is_text());
        assert!(!ct.is_multipart());
        assert_eq!(ct.param("charset"), Some("UTF-8"));
        // The original text is what gets serialized.
        assert_eq!(ct.full_value(), "Text/XML; Charset=UTF-8");
    }

    #[test]
    fn test_create_never_fails() {
        let ct = ContentTypeHeader::create("this is not a content type");
        assert!(ct.is_invalid());
        assert_eq!(ct.main_value(), "application/x-invalid-content-type");
        assert_eq!(ct.original_value(), Some("this is not a content type"));
        assert_eq!(ContentTypeHeader::create("text/plain").original_value(), None);
        assert!(ContentTypeHeader::parse_value("this is not a content type").is_err());
    }

    #[test]
    fn test_multipart_requires_boundary() {
        assert!(ContentTypeHeader::parse_value("multipart/related").is_err());
        assert!(ContentTypeHeader::parse_value("multipart/related; boundary=\"\"").is_err());
        assert!(ContentTypeHeader::parse_value("multipart/related; boundary=\"a\u{7f}\"").is_err());
        let ct = ContentTypeHeader::parse_value(
            "multipart/related; type=\"text/xml\"; boundary=\"MIME boundary 1\"; start=\"<root>\"",
        )
        .unwrap();
        assert_eq!(ct.multipart_boundary().unwrap(), "MIME boundary 1");
        assert_eq!(ct.param("start"), Some("<root>"));
    }

    #[test]
    fn test_classification() {
        assert!(ContentTypeHeader::create("application/soap+xml").is_soap12());
        assert!(ContentTypeHeader::create("application/soap+xml").is_xml());
        assert!(ContentTypeHeader::create("application/problem+json").is_json());
        assert!(ContentTypeHeader::create("text/html").is_html());
        assert!(ContentTypeHeader::create("application/x-www-form-urlencoded")
            .is_application_form_urlencoded());
        assert!(ContentTypeHeader::create("image/png").matches("image", "*"));
    }

    #[test]
    fn test_encoding_fallback_and_strict_mode() {
        let lenient = CharsetPolicy::default();
        let strict = CharsetPolicy {
            strict: true,
            ..lenient
        };
        let utf8 = ContentTypeHeader::create("text/plain; charset=utf-8");
        assert_eq!(utf8.encoding(&lenient).unwrap(), encoding_rs::UTF_8);

        let bogus = ContentTypeHeader::create("text/plain; charset=x-no-such-charset");
        assert_eq!(bogus.encoding(&lenient).unwrap(), lenient.default);
        assert!(matches!(
            bogus.encoding(&strict),
            Err(MimeError::UnsupportedEncoding(_))
        ));

        let none = ContentTypeHeader::create("text/plain");
        assert_eq!(none.encoding(&strict).unwrap(), strict.default);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(
            ContentTypeHeader::text_default().full_value(),
            "text/plain; charset=US-ASCII"
        );
        assert!(ContentTypeHeader::xml_default().is_xml());
    }
}
