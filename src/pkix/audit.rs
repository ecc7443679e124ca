//! Audit message catalog and sinks.
//!
//! Every decision the validation core makes is reported as an [`AuditEvent`]
//! with positional string parameters. The catalog fixes each event's id,
//! severity and message template (`{0}`, `{1}`, … placeholders).

use std::fmt;
use std::sync::Mutex;

use tracing::Level;

/// Catalog of audit messages emitted by certificate validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditEvent {
    Checked,
    CertExpired,
    CertNotYetValid,
    CantBuildPath,
    InvalidSetting,
    RevCacheHit,
    RevCacheMiss,
    RevCacheStale,
    RevUsingStaticUrl,
    RevCantGetUrlsFromCert,
    RevNoUrl,
    RevUrlInvalid,
    RevUrlMatch,
    RevUrlMismatch,
    RevSignerIsIssuer,
    RevSignerIsTrusted,
    RevSignerIsIssuerDelegate,
    RevIssuerNotFound,
    RevRevoked,
    RevNotRevoked,
    RevRetrievalFailed,
    CrlScope,
    RevCrlInvalid,
    OcspRecursion,
    OcspBadResponseStatus,
    OcspError,
    OcspSignerCertRevoked,
    RevPathAmbiguous,
}

impl AuditEvent {
    pub const ALL: [AuditEvent; 28] = [
        Self::Checked,
        Self::CertExpired,
        Self::CertNotYetValid,
        Self::CantBuildPath,
        Self::InvalidSetting,
        Self::RevCacheHit,
        Self::RevCacheMiss,
        Self::RevCacheStale,
        Self::RevUsingStaticUrl,
        Self::RevCantGetUrlsFromCert,
        Self::RevNoUrl,
        Self::RevUrlInvalid,
        Self::RevUrlMatch,
        Self::RevUrlMismatch,
        Self::RevSignerIsIssuer,
        Self::RevSignerIsTrusted,
        Self::RevSignerIsIssuerDelegate,
        Self::RevIssuerNotFound,
        Self::RevRevoked,
        Self::RevNotRevoked,
        Self::RevRetrievalFailed,
        Self::CrlScope,
        Self::RevCrlInvalid,
        Self::OcspRecursion,
        Self::OcspBadResponseStatus,
        Self::OcspError,
        Self::OcspSignerCertRevoked,
        Self::RevPathAmbiguous,
    ];

    /// Stable message identifier.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Checked => "CERTVAL_CHECKED",
            Self::CertExpired => "CERTVAL_CERT_EXPIRED",
            Self::CertNotYetValid => "CERTVAL_CERT_NOT_YET_VALID",
            Self::CantBuildPath => "CERTVAL_CANT_BUILD_PATH",
            Self::InvalidSetting => "CERTVAL_INVALID_SETTING",
            Self::RevCacheHit => "CERTVAL_REV_CACHE_HIT",
            Self::RevCacheMiss => "CERTVAL_REV_CACHE_MISS",
            Self::RevCacheStale => "CERTVAL_REV_CACHE_STALE",
            Self::RevUsingStaticUrl => "CERTVAL_REV_USING_STATIC_URL",
            Self::RevCantGetUrlsFromCert => "CERTVAL_REV_CANT_GET_URLS_FROM_CERT",
            Self::RevNoUrl => "CERTVAL_REV_NO_URL",
            Self::RevUrlInvalid => "CERTVAL_REV_URL_INVALID",
            Self::RevUrlMatch => "CERTVAL_REV_URL_MATCH",
            Self::RevUrlMismatch => "CERTVAL_REV_URL_MISMATCH",
            Self::RevSignerIsIssuer => "CERTVAL_REV_SIGNER_IS_ISSUER",
            Self::RevSignerIsTrusted => "CERTVAL_REV_SIGNER_IS_TRUSTED",
            Self::RevSignerIsIssuerDelegate => "CERTVAL_REV_SIGNER_IS_ISSUER_DELE",
            Self::RevIssuerNotFound => "CERTVAL_REV_ISSUER_NOT_FOUND",
            Self::RevRevoked => "CERTVAL_REV_REVOKED",
            Self::RevNotRevoked => "CERTVAL_REV_NOT_REVOKED",
            Self::RevRetrievalFailed => "CERTVAL_REV_RETRIEVAL_FAILED",
            Self::CrlScope => "CERTVAL_CRL_SCOPE",
            Self::RevCrlInvalid => "CERTVAL_REV_CRL_INVALID",
            Self::OcspRecursion => "CERTVAL_OCSP_RECURSION",
            Self::OcspBadResponseStatus => "CERTVAL_OCSP_BAD_RESPONSE_STATUS",
            Self::OcspError => "CERTVAL_OCSP_ERROR",
            Self::OcspSignerCertRevoked => "CERTVAL_OCSP_SIGNER_CERT_REVOKED",
            Self::RevPathAmbiguous => "CERTVAL_REV_PATH_AMBIGUOUS",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            Self::Checked
            | Self::RevCacheHit
            | Self::RevCacheMiss
            | Self::RevUsingStaticUrl
            | Self::RevUrlMatch
            | Self::RevSignerIsIssuer
            | Self::RevSignerIsTrusted
            | Self::RevSignerIsIssuerDelegate
            | Self::RevNotRevoked => Level::DEBUG,
            Self::RevNoUrl | Self::RevUrlMismatch | Self::CrlScope => Level::INFO,
            Self::CertExpired
            | Self::CertNotYetValid
            | Self::CantBuildPath
            | Self::InvalidSetting
            | Self::RevCacheStale
            | Self::RevCantGetUrlsFromCert
            | Self::RevUrlInvalid
            | Self::RevIssuerNotFound
            | Self::RevRevoked
            | Self::RevRetrievalFailed
            | Self::RevCrlInvalid
            | Self::OcspRecursion
            | Self::OcspBadResponseStatus
            | Self::OcspError
            | Self::OcspSignerCertRevoked
            | Self::RevPathAmbiguous => Level::WARN,
        }
    }

    pub fn template(&self) -> &'static str {
        match self {
            Self::Checked => "Certificate validity checked",
            Self::CertExpired => "Certificate expired: {0}",
            Self::CertNotYetValid => "Certificate not yet valid: {0}",
            Self::CantBuildPath => "Unable to build a trusted path for '{0}': {1}",
            Self::InvalidSetting => "Invalid validation setting for '{0}': '{1}', using revocation checking",
            Self::RevCacheHit => "Using cached {0} from '{1}'",
            Self::RevCacheMiss => "Retrieving {0} from '{1}'",
            Self::RevCacheStale => "Using stale cached {0} from '{1}' after retrieval failed: {2}",
            Self::RevUsingStaticUrl => "{0} using configured URL '{1}'",
            Self::RevCantGetUrlsFromCert => "{0} could not read URLs from certificate '{1}'",
            Self::RevNoUrl => "{0} found no URL in certificate '{1}'",
            Self::RevUrlInvalid => "{0} ignoring unsupported or relative URL '{1}'",
            Self::RevUrlMatch => "{0} using URL '{1}' from certificate '{2}'",
            Self::RevUrlMismatch => "{0} found no URL matching the policy in certificate '{1}'",
            Self::RevSignerIsIssuer => "{0} signed by issuer '{1}'",
            Self::RevSignerIsTrusted => "{0} signed by trusted certificate '{1}'",
            Self::RevSignerIsIssuerDelegate => "{0} signed by issuer delegate '{1}'",
            Self::RevIssuerNotFound => "{0} signer not found: {1}",
            Self::RevRevoked => "Certificate revoked: {0}",
            Self::RevNotRevoked => "Certificate not revoked: {0}",
            Self::RevRetrievalFailed => "{0} retrieval from '{1}' failed: {2}",
            Self::CrlScope => "CRL from '{1}' is not in scope for certificate '{0}'",
            Self::RevCrlInvalid => "Invalid CRL from '{0}': {1}",
            Self::OcspRecursion => "Recursive OCSP request for '{0}' rejected",
            Self::OcspBadResponseStatus => "OCSP responder '{0}' returned an error status: {1}",
            Self::OcspError => "OCSP request to '{0}' failed: {1}",
            Self::OcspSignerCertRevoked => "OCSP responder '{0}' signer '{1}' is revoked or unverifiable",
            Self::RevPathAmbiguous => "Revocation check for '{0}' could not build a path; treating as revoked",
        }
    }

    /// The message with `{n}` placeholders filled in. Missing params stay as-is.
    pub fn format(&self, params: &[&str]) -> String {
        let mut out = self.template().to_string();
        for (i, param) in params.iter().enumerate() {
            out = out.replace(&format!("{{{i}}}"), param);
        }
        out
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Output-only side channel for audit events.
pub trait Auditor: Send + Sync {
    fn audit(&self, event: AuditEvent, params: &[&str]);
}

/// Forwards audit events to `tracing` at the event's level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditor;

impl Auditor for TracingAuditor {
    fn audit(&self, event: AuditEvent, params: &[&str]) {
        let id = event.id();
        let message = event.format(params);
        match event.level() {
            Level::ERROR => tracing::error!(id, "{message}"),
            Level::WARN => tracing::warn!(id, "{message}"),
            Level::INFO => tracing::info!(id, "{message}"),
            Level::DEBUG => tracing::debug!(id, "{message}"),
            _ => tracing::trace!(id, "{message}"),
        }
    }
}

/// A recorded audit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub event: AuditEvent,
    pub params: Vec<String>,
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditor {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    pub fn contains(&self, event: AuditEvent) -> bool {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|r| r.event == event)
    }

    pub fn count(&self, event: AuditEvent) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.event == event)
            .count()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Auditor for MemoryAuditor {
    fn audit(&self, event: AuditEvent, params: &[&str]) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AuditRecord {
                event,
                params: params.iter().map(|p| p.to_string()).collect(),
            });
    }
}
