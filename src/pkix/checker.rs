//! Revocation checkers.
//!
//! A [`CompositeRevocationChecker`] runs one CRL or OCSP checker per policy
//! item, in policy order, and stops at the first conclusive answer.
//! Checkers are immutable once built and shared between threads; the
//! per-call state lives in a [`CheckContext`].

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, trace, warn};

use super::audit::{AuditEvent, Auditor};
use super::cert::{CertKey, Certificate, Crl};
use super::crl_cache::CrlCache;
use super::fetch::{is_supported_url, OcspError};
use super::ocsp_cache::OcspCache;
use super::processor::CertValidationProcessor;
use super::types::{CertificateValidationResult, CertificateValidationType};
use crate::error::{CertError, CertResult};

use CertificateValidationResult::{CantBuildPath, Ok as Good, Revoked, Unknown};

/// State of one logical validation call, threaded through every checker
/// and every nested validation it triggers.
pub struct CheckContext<'a> {
    auditor: &'a dyn Auditor,
    processor: &'a dyn CertValidationProcessor,
    in_flight: RefCell<HashSet<(String, CertKey)>>,
}

impl<'a> CheckContext<'a> {
    pub fn new(auditor: &'a dyn Auditor, processor: &'a dyn CertValidationProcessor) -> Self {
        Self {
            auditor,
            processor,
            in_flight: RefCell::new(HashSet::new()),
        }
    }

    pub fn auditor(&self) -> &'a dyn Auditor {
        self.auditor
    }

    pub fn processor(&self) -> &'a dyn CertValidationProcessor {
        self.processor
    }

    /// Mark an OCSP request for (`url`, `cert`) as in flight.
    ///
    /// Returns `None` if the same request is already running further up
    /// this call chain. The mark is cleared when the guard drops.
    pub fn enter(&self, url: &str, cert: &Certificate) -> Option<InFlight<'_>> {
        let key = (url.to_string(), *cert.fingerprint());
        if !self.in_flight.borrow_mut().insert(key.clone()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            key,
        })
    }
}

/// Guard returned by [`CheckContext::enter`].
pub struct InFlight<'c> {
    set: &'c RefCell<HashSet<(String, CertKey)>>,
    key: (String, CertKey),
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.borrow_mut().remove(&self.key);
    }
}

pub trait RevocationChecker: Send + Sync {
    /// Revocation status of `cert`, issued by `issuer`.
    ///
    /// `on_network_failure` is returned when the status source cannot be
    /// reached and nothing usable is cached.
    fn revocation_status(
        &self,
        cert: &Certificate,
        issuer: &Certificate,
        ctx: &CheckContext<'_>,
        on_network_failure: CertificateValidationResult,
    ) -> CertificateValidationResult;
}

// ── Composite ───────────────────────────────────────────────────

pub struct CompositeRevocationChecker {
    checkers: Vec<Box<dyn RevocationChecker>>,
    result_for_unknown: CertificateValidationResult,
    result_for_network_failure: CertificateValidationResult,
}

impl CompositeRevocationChecker {
    pub fn new(
        checkers: Vec<Box<dyn RevocationChecker>>,
        result_for_unknown: CertificateValidationResult,
        result_for_network_failure: CertificateValidationResult,
    ) -> Self {
        Self {
            checkers,
            result_for_unknown,
            result_for_network_failure,
        }
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }
}

impl RevocationChecker for CompositeRevocationChecker {
    /// The first `Ok` or `Revoked` wins. `CantBuildPath` counts as `Revoked`.
    /// When every checker is inconclusive the policy's default applies.
    fn revocation_status(
        &self,
        cert: &Certificate,
        issuer: &Certificate,
        ctx: &CheckContext<'_>,
        _on_network_failure: CertificateValidationResult,
    ) -> CertificateValidationResult {
        for checker in &self.checkers {
            match checker.revocation_status(cert, issuer, ctx, self.result_for_network_failure) {
                Good => return Good,
                Revoked => return Revoked,
                CantBuildPath => {
                    debug!(subject = cert.subject_dn(), "Revocation check could not build a path");
                    ctx.auditor()
                        .audit(AuditEvent::RevPathAmbiguous, &[cert.subject_dn()]);
                    return Revoked;
                }
                Unknown => {}
            }
        }
        trace!(
            subject = cert.subject_dn(),
            result = %self.result_for_unknown,
            "No conclusive revocation status"
        );
        self.result_for_unknown
    }
}

/// Always answers `Revoked`. Stands in for a pipeline that could not be built.
#[derive(Debug, Default, Clone, Copy)]
pub struct RevokedChecker;

impl RevocationChecker for RevokedChecker {
    fn revocation_status(
        &self,
        _cert: &Certificate,
        _issuer: &Certificate,
        _ctx: &CheckContext<'_>,
        _on_network_failure: CertificateValidationResult,
    ) -> CertificateValidationResult {
        Revoked
    }
}

// ── Shared URL and signer rules ─────────────────────────────────

/// Where a checker gets its URL from.
#[derive(Debug, Clone)]
pub enum UrlSource {
    Static(String),
    /// Full-match pattern over the URLs embedded in the certificate.
    Pattern(Regex),
}

impl UrlSource {
    /// Compile `pattern` so that it must match a whole URL.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(&format!("^(?:{pattern})$")).map(Self::Pattern)
    }
}

/// URL selection and signer authorization shared by CRL and OCSP checkers.
pub struct CheckerRules {
    pub url: UrlSource,
    pub allow_issuer_signature: bool,
    pub trusted_signers: Vec<Certificate>,
}

impl CheckerRules {
    /// The URL to query for `cert`, or `None` (already audited) when there is none.
    fn valid_url(
        &self,
        what: &str,
        cert: &Certificate,
        auditor: &dyn Auditor,
        urls_from_cert: impl FnOnce() -> CertResult<Vec<String>>,
    ) -> Option<String> {
        let pattern = match &self.url {
            UrlSource::Static(url) => {
                auditor.audit(AuditEvent::RevUsingStaticUrl, &[what, url]);
                return Some(url.clone());
            }
            UrlSource::Pattern(pattern) => pattern,
        };

        let subject = cert.subject_dn();
        let urls = match urls_from_cert() {
            Ok(urls) => urls,
            Err(e) => {
                debug!(subject, error = %e, "Could not read revocation URLs");
                auditor.audit(AuditEvent::RevCantGetUrlsFromCert, &[what, subject]);
                return None;
            }
        };
        if urls.is_empty() {
            auditor.audit(AuditEvent::RevNoUrl, &[what, subject]);
            return None;
        }

        for url in urls {
            if !pattern.is_match(&url) {
                continue;
            }
            if !is_supported_url(&url) {
                auditor.audit(AuditEvent::RevUrlInvalid, &[what, &url]);
                continue;
            }
            auditor.audit(AuditEvent::RevUrlMatch, &[what, &url, subject]);
            return Some(url);
        }

        auditor.audit(AuditEvent::RevUrlMismatch, &[what, subject]);
        None
    }

    /// Pick the certificate allowed to sign revocation data for `issuer`.
    ///
    /// With no candidates the issuer itself is used (if allowed). Otherwise
    /// the first candidate that is the issuer, a trusted signer, or an
    /// accepted delegate wins.
    fn authorized_signer(
        &self,
        what: &str,
        issuer: &Certificate,
        candidates: &[Certificate],
        auditor: &dyn Auditor,
        delegate: Option<&dyn Fn(&Certificate) -> bool>,
    ) -> Option<Certificate> {
        if candidates.is_empty() {
            if self.allow_issuer_signature {
                auditor.audit(AuditEvent::RevSignerIsIssuer, &[what, issuer.subject_dn()]);
                return Some(issuer.clone());
            }
            return None;
        }

        for candidate in candidates {
            trace!(subject = candidate.subject_dn(), "Checking signer certificate");

            if self.allow_issuer_signature && same_serial_and_issuer(issuer, candidate) {
                auditor.audit(AuditEvent::RevSignerIsIssuer, &[what, issuer.subject_dn()]);
                return Some(issuer.clone());
            }

            if let Some(trusted) = self
                .trusted_signers
                .iter()
                .find(|t| same_serial_and_issuer(t, candidate))
            {
                auditor.audit(AuditEvent::RevSignerIsTrusted, &[what, trusted.subject_dn()]);
                return Some(trusted.clone());
            }

            if self.allow_issuer_signature && delegate.is_some_and(|accept| accept(candidate)) {
                auditor.audit(
                    AuditEvent::RevSignerIsIssuerDelegate,
                    &[what, candidate.subject_dn()],
                );
                return Some(candidate.clone());
            }
        }
        None
    }
}

fn same_serial_and_issuer(a: &Certificate, b: &Certificate) -> bool {
    a.serial() == b.serial() && a.issuer_raw() == b.issuer_raw()
}

// ── CRL ─────────────────────────────────────────────────────────

/// Checks a CRL. Only CRLs issued by the certificate's own issuer are in
/// scope; any verification failure answers `Revoked`.
pub struct CrlRevocationChecker {
    rules: CheckerRules,
    crl_cache: Arc<dyn CrlCache>,
}

impl CrlRevocationChecker {
    const WHAT: &'static str = "CRL";

    pub fn new(rules: CheckerRules, crl_cache: Arc<dyn CrlCache>) -> Self {
        Self { rules, crl_cache }
    }

    /// Locate the certificate that signed `crl`, via its authority key
    /// identifier or else its issuer name.
    fn crl_signer_certificate(
        &self,
        crl: &Crl,
        issuer: &Certificate,
        url: &str,
        ctx: &CheckContext<'_>,
    ) -> Result<Certificate, CertificateValidationResult> {
        let auditor = ctx.auditor();
        let processor = ctx.processor();
        match crl.authority_key_id() {
            Some(aki) => match (&aki.key_id, &aki.issuer_dn, &aki.serial) {
                (Some(key_id), _, _) => {
                    if issuer.ski() == key_id {
                        return Ok(issuer.clone());
                    }
                    processor.certificate_by_ski(key_id).ok_or_else(|| {
                        auditor.audit(
                            AuditEvent::RevIssuerNotFound,
                            &[Self::WHAT, &format!("SKI:{key_id}")],
                        );
                        Revoked
                    })
                }
                (None, Some(dn), Some(serial)) => processor
                    .certificate_by_issuer_dn_and_serial(dn, serial)
                    .ok_or_else(|| {
                        let what = format!("IssuerDN:{dn};Serial:{}", super::cert::hex(serial));
                        auditor.audit(AuditEvent::RevIssuerNotFound, &[Self::WHAT, &what]);
                        Revoked
                    }),
                _ => {
                    auditor.audit(
                        AuditEvent::RevCrlInvalid,
                        &[
                            url,
                            "CRL Authority Key Identifier must have both a serial number and issuer name.",
                        ],
                    );
                    Err(Revoked)
                }
            },
            None => processor
                .certificate_by_subject_dn(crl.issuer_dn())
                .ok_or_else(|| {
                    auditor.audit(AuditEvent::RevIssuerNotFound, &[Self::WHAT, crl.issuer_dn()]);
                    Revoked
                }),
        }
    }
}

impl RevocationChecker for CrlRevocationChecker {
    fn revocation_status(
        &self,
        cert: &Certificate,
        issuer: &Certificate,
        ctx: &CheckContext<'_>,
        on_network_failure: CertificateValidationResult,
    ) -> CertificateValidationResult {
        let auditor = ctx.auditor();
        let Some(url) = self.rules.valid_url(Self::WHAT, cert, auditor, || {
            self.crl_cache.crl_urls_from_certificate(cert)
        }) else {
            return Unknown;
        };

        let crl = match self.crl_cache.crl(&url, auditor) {
            Ok(crl) => crl,
            Err(e @ (CertError::Io(_) | CertError::Fetch { .. })) => {
                auditor.audit(
                    AuditEvent::RevRetrievalFailed,
                    &[Self::WHAT, &url, &e.to_string()],
                );
                return on_network_failure;
            }
            Err(e) => {
                auditor.audit(AuditEvent::RevCrlInvalid, &[&url, &e.to_string()]);
                return Revoked;
            }
        };

        if crl.issuer_raw() != cert.issuer_raw() {
            auditor.audit(AuditEvent::CrlScope, &[cert.subject_dn(), &url]);
            return Unknown;
        }

        let crl_cert = match self.crl_signer_certificate(&crl, issuer, &url, ctx) {
            Ok(found) => found,
            Err(result) => return result,
        };

        let Some(signer) =
            self.rules
                .authorized_signer(Self::WHAT, issuer, &[crl_cert], auditor, None)
        else {
            auditor.audit(
                AuditEvent::RevCrlInvalid,
                &[&url, "No authorized signer found for CRL."],
            );
            return Revoked;
        };

        if !signer.allows_crl_sign() {
            warn!(issuer = crl.issuer_dn(), signer = signer.subject_dn(), "CRL signer lacks cRLSign key usage");
            return Revoked;
        }
        if let Err(e) = crl.verify_signature(&signer) {
            warn!(issuer = crl.issuer_dn(), error = %e, "Verification of CRL signature failed");
            return Revoked;
        }

        if crl.is_revoked(cert) {
            auditor.audit(AuditEvent::RevRevoked, &[cert.subject_dn()]);
            Revoked
        } else {
            auditor.audit(AuditEvent::RevNotRevoked, &[cert.subject_dn()]);
            Good
        }
    }
}

// ── OCSP ────────────────────────────────────────────────────────

/// Asks an OCSP responder. Responses may be signed by the issuer, a trusted
/// signer, or a delegate the issuer certified for OCSP signing.
pub struct OcspRevocationChecker {
    rules: CheckerRules,
    ocsp_cache: Arc<dyn OcspCache>,
}

impl OcspRevocationChecker {
    const WHAT: &'static str = "OCSP";

    pub fn new(rules: CheckerRules, ocsp_cache: Arc<dyn OcspCache>) -> Self {
        Self { rules, ocsp_cache }
    }

    /// Delegate responder certificate: issued and signed by `issuer`, with
    /// the OCSP-signing EKU, and itself not revoked unless it carries
    /// id-pkix-ocsp-nocheck.
    fn is_permitted_delegate(
        &self,
        candidate: &Certificate,
        issuer: &Certificate,
        url: &str,
        ctx: &CheckContext<'_>,
    ) -> bool {
        if candidate.issuer_raw() != issuer.subject_raw() || !candidate.has_ocsp_signing_eku() {
            return false;
        }
        if let Err(e) = candidate.verify_signed_by(issuer) {
            warn!(subject = candidate.subject_dn(), error = %e, "OCSP delegate not signed by issuer");
            return false;
        }
        if candidate.has_ocsp_nocheck() {
            return true;
        }

        let verdict = ctx.processor().check_in_context(
            std::slice::from_ref(candidate),
            CertificateValidationType::CertificateOnly,
            Some(CertificateValidationType::Revocation),
            None,
            ctx,
        );
        if matches!(verdict, Ok(Good)) {
            return true;
        }
        ctx.auditor().audit(
            AuditEvent::OcspSignerCertRevoked,
            &[url, candidate.subject_dn()],
        );
        false
    }
}

impl RevocationChecker for OcspRevocationChecker {
    fn revocation_status(
        &self,
        cert: &Certificate,
        issuer: &Certificate,
        ctx: &CheckContext<'_>,
        on_network_failure: CertificateValidationResult,
    ) -> CertificateValidationResult {
        let auditor = ctx.auditor();
        let Some(url) = self.rules.valid_url(Self::WHAT, cert, auditor, || {
            Ok(cert.ocsp_responder_urls().to_vec())
        }) else {
            return Unknown;
        };

        let Some(_in_flight) = ctx.enter(&url, cert) else {
            auditor.audit(AuditEvent::OcspRecursion, &[&url]);
            return Revoked;
        };

        let accept_delegate = |candidate: &Certificate| self.is_permitted_delegate(candidate, issuer, &url, ctx);
        let authorizer = |candidates: &[Certificate]| {
            self.rules
                .authorized_signer(Self::WHAT, issuer, candidates, auditor, Some(&accept_delegate))
        };

        match self.ocsp_cache.status(&url, cert, issuer, &authorizer, auditor) {
            Ok(status) => {
                let result = status.result();
                match result {
                    Good => auditor.audit(AuditEvent::RevNotRevoked, &[cert.subject_dn()]),
                    Revoked => auditor.audit(AuditEvent::RevRevoked, &[cert.subject_dn()]),
                    _ => {}
                }
                result
            }
            Err(e @ OcspError::BadResponseStatus(_)) => {
                auditor.audit(AuditEvent::OcspBadResponseStatus, &[&url, &e.to_string()]);
                Revoked
            }
            Err(e) => {
                auditor.audit(AuditEvent::OcspError, &[&url, &e.to_string()]);
                on_network_failure
            }
        }
    }
}
