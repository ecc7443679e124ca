//! Certificate path validation with cached CRL and OCSP revocation checking.
//!
//! The entry point is [`CertValidationProcessor::check`]. Trusted
//! certificates and revocation policies come from the store traits in
//! [`store`]; revocation data is fetched through [`fetch`] and cached per
//! URL. Audit events go to an [`Auditor`] passed with every call.

pub mod audit;
mod cache;
pub mod cert;
pub mod checker;
pub mod crl_cache;
pub mod factory;
pub mod fetch;
pub mod ocsp_cache;
pub mod path;
pub mod processor;
pub mod store;
pub mod types;

pub type Result<T> = crate::error::CertResult<T>;

pub use audit::{AuditEvent, Auditor, MemoryAuditor, TracingAuditor};
pub use cert::{Certificate, Crl};
pub use checker::{CheckContext, RevocationChecker};
pub use crl_cache::{CrlCache, CrlCacheImpl};
pub use factory::RevocationCheckerFactory;
pub use fetch::{MemoryFetcher, OcspClient, UnavailableOcspClient, UrlFetcher};
pub use ocsp_cache::{OcspCache, OcspCacheImpl};
pub use path::PathBuilder;
pub use processor::{CertValidationProcessor, CertValidationProcessorImpl};
pub use store::{MemoryPolicyStore, MemoryTrustedCertStore, RevocationPolicyStore, TrustedCertStore};
pub use types::{
    CertificateValidationResult, CertificateValidationType, EntityId, EntityInvalidation, EntityKind,
    Facility, InvalidationOp, PolicyRef, RevocationCheckKind, RevocationCheckPolicy,
    RevocationCheckPolicyItem, TrustedCert,
};
