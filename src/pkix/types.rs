//! Validation levels, verdicts, revocation policies and trusted-cert entities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::cert::Certificate;

/// Primary key of a trusted certificate or revocation policy in its store.
pub type EntityId = u64;

/// Id of the synthetic policy used when no default policy is configured.
/// Stores never hand out this id.
pub const BUILTIN_POLICY_ID: EntityId = 0;

/// How much checking a certificate gets. Ordered from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateValidationType {
    /// Validity period of the leaf only.
    CertificateOnly,
    /// Path to a trust anchor, without revocation checking.
    PathValidation,
    /// Path plus revocation status of every certificate on it.
    Revocation,
}

impl CertificateValidationType {
    /// The stronger of `min` and `requested`.
    pub fn effective(min: Self, requested: Self) -> Self {
        min.max(requested)
    }

    /// Parse a facility setting; `None` for an unknown value.
    pub fn from_setting(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "validate" => Some(Self::CertificateOnly),
            "validatepath" => Some(Self::PathValidation),
            "revocation" => Some(Self::Revocation),
            _ => None,
        }
    }

    pub fn as_setting(&self) -> &'static str {
        match self {
            Self::CertificateOnly => "validate",
            Self::PathValidation => "validatepath",
            Self::Revocation => "revocation",
        }
    }
}

impl FromStr for CertificateValidationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_setting(s).ok_or_else(|| {
            format!("unknown validation level '{s}' (expected validate, validatepath or revocation)")
        })
    }
}

/// Verdict of a validation or revocation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateValidationResult {
    Ok,
    Revoked,
    Unknown,
    CantBuildPath,
}

impl fmt::Display for CertificateValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Revoked => "REVOKED",
            Self::Unknown => "UNKNOWN",
            Self::CantBuildPath => "CANT_BUILD_PATH",
        })
    }
}

/// Where a revocation check gets its URL and which protocol it speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevocationCheckKind {
    /// CRL distribution point from the certificate, filtered by a regex.
    CrlFromCertificate,
    /// Fixed CRL URL.
    CrlFromUrl,
    /// OCSP responder from the certificate's AIA, filtered by a regex.
    OcspFromCertificate,
    /// Fixed OCSP responder URL.
    OcspFromUrl,
}

impl RevocationCheckKind {
    pub fn is_crl(&self) -> bool {
        matches!(self, Self::CrlFromCertificate | Self::CrlFromUrl)
    }

    pub fn uses_certificate_urls(&self) -> bool {
        matches!(self, Self::CrlFromCertificate | Self::OcspFromCertificate)
    }
}

/// One step of a revocation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationCheckPolicyItem {
    pub kind: RevocationCheckKind,
    /// A URL, or a regex over certificate URLs for the `*FromCertificate` kinds.
    pub url: String,
    /// The issuing CA may sign the CRL or OCSP response itself.
    pub allow_issuer_signature: bool,
    /// Trusted certificates that may sign instead of the issuer.
    pub trusted_signers: Vec<EntityId>,
}

/// Ordered list of revocation checks plus the fallback verdicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationCheckPolicy {
    pub id: EntityId,
    pub name: String,
    pub default_policy: bool,
    /// Verdict when every check is inconclusive: `Ok` if true, else `Revoked`.
    pub default_success: bool,
    /// Treat an unreachable server as inconclusive rather than revoked.
    pub continue_on_server_unavailable: bool,
    pub items: Vec<RevocationCheckPolicyItem>,
}

impl RevocationCheckPolicy {
    /// Checks nothing and accepts everything.
    pub fn permissive() -> Self {
        Self {
            id: BUILTIN_POLICY_ID,
            name: "Permissive".to_string(),
            default_policy: false,
            default_success: true,
            continue_on_server_unavailable: true,
            items: Vec::new(),
        }
    }

    /// Stand-in default when none is configured: checks nothing, rejects everything.
    pub fn fail_closed() -> Self {
        Self {
            id: BUILTIN_POLICY_ID,
            name: "Default".to_string(),
            default_policy: true,
            default_success: false,
            continue_on_server_unavailable: false,
            items: Vec::new(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.id == BUILTIN_POLICY_ID
    }

    pub fn result_for_unknown(&self) -> CertificateValidationResult {
        if self.default_success {
            CertificateValidationResult::Ok
        } else {
            CertificateValidationResult::Revoked
        }
    }

    pub fn result_for_network_failure(&self) -> CertificateValidationResult {
        if self.continue_on_server_unavailable {
            CertificateValidationResult::Unknown
        } else {
            CertificateValidationResult::Revoked
        }
    }
}

/// Which revocation policy applies to certificates issued by a trusted cert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PolicyRef {
    /// No revocation checking.
    None,
    #[default]
    UseDefault,
    Specified(EntityId),
}

/// A certificate an administrator has imported and configured.
#[derive(Debug, Clone)]
pub struct TrustedCert {
    pub id: EntityId,
    pub name: String,
    pub certificate: Certificate,
    pub trust_anchor: bool,
    pub revocation_policy: PolicyRef,
}

/// Which store an invalidation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    TrustedCert,
    Policy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationOp {
    Create,
    Update,
    Delete,
}

/// Change notification from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInvalidation {
    pub kind: EntityKind,
    pub changes: Vec<(EntityId, InvalidationOp)>,
}

impl EntityInvalidation {
    pub fn single(kind: EntityKind, id: EntityId, op: InvalidationOp) -> Self {
        Self {
            kind,
            changes: vec![(id, op)],
        }
    }
}

/// Subsystem asking for a validation; selects the configured level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Facility {
    Routing,
    Identity,
    Other(String),
}

impl Facility {
    /// Key under `[pkix.facilities]`.
    pub fn name(&self) -> &str {
        match self {
            Self::Routing => "routing",
            Self::Identity => "identity",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for Facility {
    fn from(name: &str) -> Self {
        match name {
            "routing" => Self::Routing,
            "identity" => Self::Identity,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Facility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
