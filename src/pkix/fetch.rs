//! Network collaborators: a URL fetcher for CRLs and an OCSP client.
//!
//! The core owns no sockets. Callers plug in HTTP/LDAP implementations;
//! [`MemoryFetcher`] and [`UnavailableOcspClient`] serve the CLI and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::cert::Certificate;
use super::types::CertificateValidationResult;
use crate::error::{CertError, CertResult as Result};

const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "ldap", "ldaps"];

/// Payload returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Fetches bytes from a URL; used for CRL retrieval.
pub trait UrlFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Fetched>;
}

fn scheme(url: &str) -> Option<&str> {
    let (scheme, rest) = url.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    (valid && !rest.is_empty()).then_some(scheme)
}

/// True for a URL with a scheme and authority.
pub fn is_absolute_url(url: &str) -> bool {
    scheme(url).is_some()
}

/// True for an absolute http, https, ldap or ldaps URL.
pub fn is_supported_url(url: &str) -> bool {
    scheme(url).is_some_and(|s| SUPPORTED_SCHEMES.iter().any(|known| s.eq_ignore_ascii_case(known)))
}

/// Serves fixed payloads by URL. Unknown URLs fail like an unreachable server.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    responses: RwLock<HashMap<String, Bytes>>,
    fetches: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, bytes: impl Into<Bytes>) {
        self.responses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.into(), bytes.into());
    }

    pub fn remove(&self, url: &str) {
        self.responses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(url);
    }

    /// Number of `fetch` calls so far, successful or not.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl UrlFetcher for MemoryFetcher {
    fn fetch(&self, url: &str) -> Result<Fetched> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !is_supported_url(url) {
            return Err(CertError::Fetch {
                url: url.to_string(),
                reason: "unsupported URL scheme".to_string(),
            });
        }
        let responses = self.responses.read().unwrap_or_else(|e| e.into_inner());
        match responses.get(url) {
            Some(bytes) => Ok(Fetched {
                content_type: Some("application/pkix-crl".to_string()),
                bytes: bytes.clone(),
            }),
            None => Err(CertError::Io(std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("no server for {url}"),
            )))),
        }
    }
}

// ── OCSP ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspCertStatus {
    Good,
    Revoked,
    Unknown,
}

/// Certificate status from a verified OCSP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspStatus {
    pub status: OcspCertStatus,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
}

impl OcspStatus {
    pub fn result(&self) -> CertificateValidationResult {
        match self.status {
            OcspCertStatus::Good => CertificateValidationResult::Ok,
            OcspCertStatus::Revoked => CertificateValidationResult::Revoked,
            OcspCertStatus::Unknown => CertificateValidationResult::Unknown,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OcspError {
    /// The responder answered with a non-successful response status.
    #[error("OCSP responder returned status {0}")]
    BadResponseStatus(u8),

    /// None of the response's signer certificates was accepted.
    #[error("OCSP response signer is not authorized")]
    UnauthorizedSigner,

    /// Transport or encoding failure.
    #[error("{0}")]
    Other(String),
}

/// Picks the authorized signer out of a responder's certificate chain.
pub type SignerAuthorizer<'a> = dyn Fn(&[Certificate]) -> Option<Certificate> + 'a;

/// Performs OCSP requests and verifies responses.
pub trait OcspClient: Send + Sync {
    /// Query the status of `cert`. Implementations pass the responder's
    /// certificates to `authorizer` and must reject the response with
    /// [`OcspError::UnauthorizedSigner`] when it returns `None`.
    fn request_status(
        &self,
        url: &str,
        cert: &Certificate,
        issuer: &Certificate,
        use_nonce: bool,
        authorizer: &SignerAuthorizer<'_>,
    ) -> std::result::Result<OcspStatus, OcspError>;
}

/// Client for deployments without OCSP: every request fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableOcspClient;

impl OcspClient for UnavailableOcspClient {
    fn request_status(
        &self,
        url: &str,
        _cert: &Certificate,
        _issuer: &Certificate,
        _use_nonce: bool,
        _authorizer: &SignerAuthorizer<'_>,
    ) -> std::result::Result<OcspStatus, OcspError> {
        Err(OcspError::Other(format!("no OCSP client configured for {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_classification() {
        assert!(is_supported_url("http://crl.example.com/ca.crl"));
        assert!(is_supported_url("LDAPS://dir.example.com/cn=ca"));
        assert!(!is_supported_url("ftp://example.com/ca.crl"));
        assert!(!is_supported_url("/relative/ca.crl"));
        assert!(is_absolute_url("ftp://example.com/ca.crl"));
        assert!(!is_absolute_url("ca.crl"));
        assert!(!is_absolute_url("http://"));
    }

    #[test]
    fn test_memory_fetcher() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("http://x/a.crl", vec![1u8, 2, 3]);
        assert_eq!(fetcher.fetch("http://x/a.crl").unwrap().bytes.as_ref(), &[1, 2, 3]);
        assert!(matches!(fetcher.fetch("http://x/b.crl"), Err(CertError::Io(_))));
        assert!(matches!(fetcher.fetch("file:///etc/passwd"), Err(CertError::Fetch { .. })));
        assert_eq!(fetcher.fetch_count(), 3);
    }
}
