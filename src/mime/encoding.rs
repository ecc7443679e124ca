//! Content-Transfer-Encoding (RFC 2045 section 6).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{MimeError, MimeResult as Result};

const LINE_LIMIT: usize = 76;

const HEX_DECODE: [i8; 256] = {
    let mut t = [-1i8; 256];
    let mut i = 0u8;
    while i < 10 {
        t[(b'0' + i) as usize] = i as i8;
        i += 1;
    }
    let mut i = 0u8;
    while i < 6 {
        t[(b'A' + i) as usize] = (10 + i) as i8;
        t[(b'a' + i) as usize] = (10 + i) as i8;
        i += 1;
    }
    t
};

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// A part's transfer encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEncoding {
    SevenBit,
    EightBit,
    Binary,
    Base64,
    QuotedPrintable,
    Other(String),
}

impl TransferEncoding {
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "7bit" => Self::SevenBit,
            "8bit" => Self::EightBit,
            "binary" => Self::Binary,
            "base64" => Self::Base64,
            "quoted-printable" => Self::QuotedPrintable,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::SevenBit => "7bit",
            Self::EightBit => "8bit",
            Self::Binary => "binary",
            Self::Base64 => "base64",
            Self::QuotedPrintable => "quoted-printable",
            Self::Other(name) => name,
        }
    }

    /// True when the encoded form equals the decoded form.
    pub fn is_identity(&self) -> bool {
        matches!(self, Self::SevenBit | Self::EightBit | Self::Binary)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Base64 => {
                let compact: Vec<u8> = data
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                STANDARD
                    .decode(compact)
                    .map_err(|e| MimeError::parse(format!("Invalid base64 part body: {e}")))
            }
            Self::QuotedPrintable => Ok(decode_quoted_printable(data)),
            Self::Other(name) => Err(MimeError::UnsupportedEncoding(name.clone())),
            _ => Ok(data.to_vec()),
        }
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Base64 => Ok(wrap_lines(STANDARD.encode(data).as_bytes())),
            Self::QuotedPrintable => Ok(encode_quoted_printable(data)),
            Self::Other(name) => Err(MimeError::UnsupportedEncoding(name.clone())),
            _ => Ok(data.to_vec()),
        }
    }
}

impl std::fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn wrap_lines(encoded: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / LINE_LIMIT * 2);
    for (i, line) in encoded.chunks(LINE_LIMIT).enumerate() {
        if i > 0 {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(line);
    }
    out
}

/// Lenient decoder: malformed escapes are passed through literally.
fn decode_quoted_printable(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        let b = src[i];
        if b != b'=' {
            out.push(b);
            i += 1;
            continue;
        }
        match (src.get(i + 1), src.get(i + 2)) {
            (Some(b'\r'), Some(b'\n')) => i += 3,
            (Some(b'\n'), _) => i += 2,
            (Some(&h1), Some(&h2)) if HEX_DECODE[h1 as usize] >= 0 && HEX_DECODE[h2 as usize] >= 0 => {
                out.push(((HEX_DECODE[h1 as usize] as u8) << 4) | HEX_DECODE[h2 as usize] as u8);
                i += 3;
            }
            _ => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

fn encode_quoted_printable(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / 8);
    let mut line_len = 0;
    let mut i = 0;
    while i < src.len() {
        let b = src[i];
        if b == b'\r' && src.get(i + 1) == Some(&b'\n') {
            out.extend_from_slice(b"\r\n");
            line_len = 0;
            i += 2;
            continue;
        }
        let at_line_end = matches!(src.get(i + 1), None | Some(b'\r'));
        let literal = (b == b' ' || b == b'\t') && !at_line_end
            || (b'!'..=b'~').contains(&b) && b != b'=';
        let width = if literal { 1 } else { 3 };
        if line_len + width > LINE_LIMIT - 1 {
            out.extend_from_slice(b"=\r\n");
            line_len = 0;
        }
        if literal {
            out.push(b);
        } else {
            out.push(b'=');
            out.push(HEX_UPPER[(b >> 4) as usize]);
            out.push(HEX_UPPER[(b & 0x0f) as usize]);
        }
        line_len += width;
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_header() {
        assert_eq!(TransferEncoding::from_header(" BASE64 "), TransferEncoding::Base64);
        assert_eq!(
            TransferEncoding::from_header("Quoted-Printable"),
            TransferEncoding::QuotedPrintable
        );
        assert!(TransferEncoding::from_header("binary").is_identity());
        assert_eq!(
            TransferEncoding::from_header("x-uuencode"),
            TransferEncoding::Other("x-uuencode".to_string())
        );
    }

    #[test]
    fn test_base64_decode_ignores_line_breaks() {
        let decoded = TransferEncoding::Base64.decode(b"PGEv\r\nPg==\r\n").unwrap();
        assert_eq!(decoded, b"<a/>");
    }

    #[test]
    fn test_base64_encode_wraps_at_76() {
        let encoded = TransferEncoding::Base64.encode(&[0u8; 120]).unwrap();
        let first_line = encoded.split(|&b| b == b'\r').next().unwrap();
        assert_eq!(first_line.len(), 76);
        assert_eq!(TransferEncoding::Base64.decode(&encoded).unwrap(), vec![0u8; 120]);
    }

    #[test]
    fn test_quoted_printable_decode() {
        let decoded = TransferEncoding::QuotedPrintable
            .decode(b"caf=C3=A9 =\r\nsoft=3Dbreak =ZZ")
            .unwrap();
        assert_eq!(decoded, "café soft=break =ZZ".as_bytes());
    }

    #[test]
    fn test_quoted_printable_encode_escapes_and_soft_breaks() {
        let text = "naïve = ".repeat(20);
        let encoded = TransferEncoding::QuotedPrintable.encode(text.as_bytes()).unwrap();
        assert!(encoded
            .split(|&b| b == b'\n')
            .all(|line| line.len() <= LINE_LIMIT + 1));
        // Trailing space is encoded so it survives transport.
        assert!(encoded.ends_with(b"=20"));
        let decoded = TransferEncoding::QuotedPrintable.decode(&encoded).unwrap();
        assert_eq!(decoded, text.as_bytes());
    }

    #[test]
    fn test_unknown_encoding_is_an_error() {
        let enc = TransferEncoding::Other("x-custom".to_string());
        assert!(matches!(enc.decode(b"x"), Err(MimeError::UnsupportedEncoding(_))));
    }
}
