//! Centralized error types for mimetrust.

use std::sync::Arc;

use thiserror::Error;

/// Errors produced by the MIME parser, header model and stash managers.
///
/// `Clone` so a body can latch the first failure and hand the same error
/// back on every later call.
#[derive(Error, Debug, Clone)]
pub enum MimeError {
    /// I/O error from the underlying source or stash storage.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Structural problem in the MIME stream.
    #[error("{0}")]
    Parse(String),

    /// The requested part does not exist (or cannot exist any more).
    #[error("{}", no_such_part_message(.ordinal, .content_id, .reason))]
    NoSuchPart {
        ordinal: Option<usize>,
        content_id: Option<String>,
        reason: String,
    },

    /// A Content-Type value could not be parsed.
    #[error("Invalid Content-Type: {0}")]
    InvalidContentType(String),

    /// A header line or header collection was malformed.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Unknown charset (strict mode) or content transfer encoding.
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    /// The body of this part was already read destructively.
    #[error("The body of MIME part #{ordinal} has already been read")]
    Destroyed { ordinal: usize },

    /// A part's declared Content-Length did not match its streamed size.
    #[error(
        "MIME multipart message part #{ordinal} declared in Content-Length header that size was {declared} bytes, but actual size was {actual} bytes"
    )]
    ContentLengthMismatch {
        ordinal: usize,
        declared: u64,
        actual: u64,
    },

    /// A stash or body was used after `close()`.
    #[error("MIME body has been closed")]
    Closed,
}

fn no_such_part_message(ordinal: &Option<usize>, content_id: &Option<String>, reason: &str) -> String {
    match (ordinal, content_id) {
        (_, Some(cid)) if reason.is_empty() => format!("No part with Content-ID {cid}"),
        (Some(n), None) if reason.is_empty() => format!("No part #{n}"),
        _ => reason.to_string(),
    }
}

impl MimeError {
    /// Wrap an `io::Error` so it can be latched and cloned.
    pub fn io(source: std::io::Error) -> Self {
        Self::Io(Arc::new(source))
    }

    /// Shorthand for a structural parse failure.
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse(reason.into())
    }

    /// Turn this error back into an `io::Error` for `Read` adapters.
    pub fn into_io(self) -> std::io::Error {
        match self {
            Self::Io(e) => std::io::Error::new(e.kind(), e.to_string()),
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<std::io::Error> for MimeError {
    fn from(source: std::io::Error) -> Self {
        // Errors produced by `into_io` map back to the original variant.
        if let Some(mime) = source.get_ref().and_then(|e| e.downcast_ref::<MimeError>()) {
            return mime.clone();
        }
        Self::io(source)
    }
}

/// Convenience alias for `Result<T, MimeError>`.
pub type MimeResult<T> = std::result::Result<T, MimeError>;

/// Reason a certification path could not be built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("certificate '{subject}' expired at {not_after}")]
    Expired { subject: String, not_after: String },

    #[error("certificate '{subject}' is not valid before {not_before}")]
    NotYetValid { subject: String, not_before: String },

    #[error("no trusted path found for '{0}'")]
    NoPath(String),

    #[error("certificate '{0}' is revoked")]
    Revoked(String),

    #[error("certificate '{subject}' has unsupported critical extension {oid}")]
    UnsupportedCriticalExtension { subject: String, oid: String },

    #[error("certificate '{subject}' may not issue here: {reason}")]
    IssuerNotPermitted { subject: String, reason: String },
}

/// Errors produced by the certificate-validation core.
#[derive(Error, Debug, Clone)]
pub enum CertError {
    #[error("Certificate '{subject}' expired at {not_after}")]
    Expired { subject: String, not_after: String },

    #[error("Certificate '{subject}' is not yet valid (valid from {not_before})")]
    NotYetValid { subject: String, not_before: String },

    #[error("Unable to parse certificate data: {0}")]
    Parse(String),

    #[error("Signature verification failed: {0}")]
    Signature(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Unable to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },

    #[error("OCSP error: {0}")]
    Ocsp(String),

    #[error("Certificate store error: {0}")]
    Store(String),

    #[error("Revocation policy error: {0}")]
    Policy(String),

    #[error("Path building failed: {0}")]
    PathBuild(#[from] PathError),
}

impl From<std::io::Error> for CertError {
    fn from(source: std::io::Error) -> Self {
        Self::Io(Arc::new(source))
    }
}

/// Convenience alias for `Result<T, CertError>`.
pub type CertResult<T> = std::result::Result<T, CertError>;
