//! Read-through CRL cache.

use std::sync::Arc;

use tracing::debug;

use super::audit::Auditor;
use super::cache::ExpiringCache;
use super::cert::{Certificate, Crl};
use super::fetch::UrlFetcher;
use crate::config::PkixConfig;
use crate::error::{CertError, CertResult as Result};

pub trait CrlCache: Send + Sync {
    /// The CRL published at `url`, from cache while fresh.
    ///
    /// An expired copy is returned when the refresh fails; the error
    /// surfaces only when nothing was ever cached for `url`.
    fn crl(&self, url: &str, auditor: &dyn Auditor) -> Result<Crl>;

    /// CRL distribution point URLs named by `cert`.
    fn crl_urls_from_certificate(&self, cert: &Certificate) -> Result<Vec<String>>;
}

pub struct CrlCacheImpl {
    fetcher: Arc<dyn UrlFetcher>,
    cache: ExpiringCache<String, Crl>,
}

impl CrlCacheImpl {
    pub fn new(fetcher: Arc<dyn UrlFetcher>, config: &PkixConfig) -> Self {
        Self {
            fetcher,
            cache: ExpiringCache::new("CRL", config.crl_ages()),
        }
    }

    /// Number of URLs seen so far.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CrlCache for CrlCacheImpl {
    fn crl(&self, url: &str, auditor: &dyn Auditor) -> Result<Crl> {
        self.cache.get_or_fetch(
            &url.to_string(),
            url,
            auditor,
            |_: &CertError| true,
            || {
                let fetched = self.fetcher.fetch(url)?;
                let crl = Crl::from_pem_or_der(&fetched.bytes)?;
                debug!(
                    url,
                    issuer = crl.issuer_dn(),
                    revoked = crl.revoked_count(),
                    "Fetched CRL"
                );
                let next_update = crl.next_update();
                Ok((crl, next_update))
            },
        )
    }

    fn crl_urls_from_certificate(&self, cert: &Certificate) -> Result<Vec<String>> {
        Ok(cert.crl_distribution_urls().to_vec())
    }
}
