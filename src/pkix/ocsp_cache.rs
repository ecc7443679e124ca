//! Read-through cache of OCSP responses, keyed by responder URL and certificate.

use std::sync::Arc;

use super::audit::Auditor;
use super::cache::ExpiringCache;
use super::cert::{CertKey, Certificate};
use super::fetch::{OcspClient, OcspError, OcspStatus, SignerAuthorizer};
use crate::config::PkixConfig;

pub trait OcspCache: Send + Sync {
    /// Status of `cert` from the responder at `url`, from cache while fresh.
    fn status(
        &self,
        url: &str,
        cert: &Certificate,
        issuer: &Certificate,
        authorizer: &SignerAuthorizer<'_>,
        auditor: &dyn Auditor,
    ) -> Result<OcspStatus, OcspError>;
}

pub struct OcspCacheImpl {
    client: Arc<dyn OcspClient>,
    use_nonce: bool,
    cache: ExpiringCache<(String, CertKey), OcspStatus>,
}

impl OcspCacheImpl {
    pub fn new(client: Arc<dyn OcspClient>, config: &PkixConfig) -> Self {
        Self {
            client,
            use_nonce: config.ocsp_use_nonce,
            cache: ExpiringCache::new("OCSP response", config.ocsp_ages()),
        }
    }
}

impl OcspCache for OcspCacheImpl {
    fn status(
        &self,
        url: &str,
        cert: &Certificate,
        issuer: &Certificate,
        authorizer: &SignerAuthorizer<'_>,
        auditor: &dyn Auditor,
    ) -> Result<OcspStatus, OcspError> {
        let key = (url.to_string(), *cert.fingerprint());
        self.cache.get_or_fetch(
            &key,
            url,
            auditor,
            // No stale fallback once a signer was rejected.
            |e: &OcspError| !matches!(e, OcspError::UnauthorizedSigner),
            || {
                let status = self
                    .client
                    .request_status(url, cert, issuer, self.use_nonce, authorizer)?;
                let next_update = status.next_update;
                Ok((status, next_update))
            },
        )
    }
}
