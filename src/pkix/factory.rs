//! Builds and caches one revocation-checking pipeline per issuer certificate.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use tracing::{debug, warn};

use super::cert::{CertKey, Certificate};
use super::checker::{
    CheckerRules, CompositeRevocationChecker, CrlRevocationChecker, OcspRevocationChecker,
    RevocationChecker, RevokedChecker, UrlSource,
};
use super::crl_cache::CrlCache;
use super::ocsp_cache::OcspCache;
use super::processor::CertValidationProcessor;
use super::types::{EntityId, RevocationCheckKind, RevocationCheckPolicy};
use crate::config::PkixConfig;

/// Which entities a cached pipeline was built from.
#[derive(Default)]
struct ReverseIndex {
    by_policy: HashMap<EntityId, HashSet<CertKey>>,
    by_trusted_cert: HashMap<EntityId, HashSet<CertKey>>,
    /// Bumped by every invalidation.
    generation: u64,
}

impl ReverseIndex {
    fn record(&mut self, key: CertKey, deps: &Dependencies) {
        if let Some(policy) = deps.policy {
            self.by_policy.entry(policy).or_default().insert(key);
        }
        for id in &deps.trusted_certs {
            self.by_trusted_cert.entry(*id).or_default().insert(key);
        }
    }
}

#[derive(Default)]
struct Dependencies {
    policy: Option<EntityId>,
    trusted_certs: Vec<EntityId>,
}

pub struct RevocationCheckerFactory {
    crl_cache: Arc<dyn CrlCache>,
    ocsp_cache: Arc<dyn OcspCache>,
    checkers: Mutex<LruCache<CertKey, Arc<dyn RevocationChecker>>>,
    reverse: RwLock<ReverseIndex>,
}

impl RevocationCheckerFactory {
    pub fn new(crl_cache: Arc<dyn CrlCache>, ocsp_cache: Arc<dyn OcspCache>, config: &PkixConfig) -> Self {
        let capacity = NonZeroUsize::new(config.checker_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            crl_cache,
            ocsp_cache,
            checkers: Mutex::new(LruCache::new(capacity)),
            reverse: RwLock::new(ReverseIndex::default()),
        }
    }

    /// The pipeline for certificates issued by `issuer`.
    ///
    /// Never fails: if the pipeline cannot be built, a checker that always
    /// answers revoked is returned (and not cached).
    pub fn revocation_checker(
        &self,
        issuer: &Certificate,
        processor: &dyn CertValidationProcessor,
    ) -> Arc<dyn RevocationChecker> {
        let key = *issuer.fingerprint();
        if let Some(checker) = self.lock_checkers().get(&key) {
            return Arc::clone(checker);
        }

        let generation = self.read_reverse().generation;
        let (checker, deps) = match self.build(issuer, processor) {
            Some(built) => built,
            None => return Arc::new(RevokedChecker),
        };

        // Lock order: reverse index, then checkers.
        let mut reverse = self.reverse.write().unwrap_or_else(|e| e.into_inner());
        if reverse.generation != generation {
            // Built from entities invalidated meanwhile; use once, don't cache.
            debug!(issuer = issuer.subject_dn(), "Revocation checker outdated before caching");
            return checker;
        }
        let mut checkers = self.lock_checkers();
        if let Some(existing) = checkers.get(&key) {
            return Arc::clone(existing);
        }
        reverse.record(key, &deps);
        checkers.put(key, Arc::clone(&checker));
        drop(checkers);
        drop(reverse);

        debug!(issuer = issuer.subject_dn(), policy = ?deps.policy, "Built revocation checker");
        checker
    }

    /// Drop pipelines built from trusted cert `id`, plus the one keyed by
    /// `certificate` (a newly created or not yet used trusted cert).
    pub fn invalidate_trusted_cert(&self, id: EntityId, certificate: Option<&Certificate>) {
        let mut reverse = self.reverse.write().unwrap_or_else(|e| e.into_inner());
        reverse.generation += 1;
        let mut keys = reverse.by_trusted_cert.remove(&id).unwrap_or_default();
        if let Some(cert) = certificate {
            keys.insert(*cert.fingerprint());
        }
        self.purge(&keys);
        debug!(trusted_cert = id, purged = keys.len(), "Invalidated revocation checkers");
    }

    /// Drop pipelines built from policy `id`.
    pub fn invalidate_policy(&self, id: EntityId) {
        let mut reverse = self.reverse.write().unwrap_or_else(|e| e.into_inner());
        reverse.generation += 1;
        let keys = reverse.by_policy.remove(&id).unwrap_or_default();
        self.purge(&keys);
        debug!(policy = id, purged = keys.len(), "Invalidated revocation checkers");
    }

    /// Drop every pipeline.
    pub fn invalidate_all(&self) {
        let mut reverse = self.reverse.write().unwrap_or_else(|e| e.into_inner());
        *reverse = ReverseIndex {
            generation: reverse.generation + 1,
            ..ReverseIndex::default()
        };
        self.lock_checkers().clear();
        debug!("Invalidated all revocation checkers");
    }

    /// Number of cached pipelines.
    pub fn cached_len(&self) -> usize {
        self.lock_checkers().len()
    }

    fn purge(&self, keys: &HashSet<CertKey>) {
        let mut checkers = self.lock_checkers();
        for key in keys {
            checkers.pop(key);
        }
    }

    fn read_reverse(&self) -> std::sync::RwLockReadGuard<'_, ReverseIndex> {
        self.reverse.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_checkers(&self) -> std::sync::MutexGuard<'_, LruCache<CertKey, Arc<dyn RevocationChecker>>> {
        self.checkers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn build(
        &self,
        issuer: &Certificate,
        processor: &dyn CertValidationProcessor,
    ) -> Option<(Arc<dyn RevocationChecker>, Dependencies)> {
        let trusted = match processor.trusted_cert_entry(issuer) {
            Ok(trusted) => trusted,
            Err(e) => {
                warn!(issuer = issuer.subject_dn(), error = %e, "Unable to create revocation checker");
                return None;
            }
        };

        let mut deps = Dependencies::default();
        let policy = match &trusted {
            Some(tc) => {
                deps.trusted_certs.push(tc.id);
                processor.revocation_policy_for(tc)
            }
            None => Some(processor.default_policy()),
        };
        if let Some(policy) = policy.as_ref().filter(|p| !p.is_builtin()) {
            deps.policy = Some(policy.id);
        }

        let composite = match policy {
            Some(policy) => self.build_composite(&policy, processor, &mut deps),
            // A specified policy that no longer exists fails closed.
            None => CompositeRevocationChecker::new(
                Vec::new(),
                RevocationCheckPolicy::fail_closed().result_for_unknown(),
                RevocationCheckPolicy::fail_closed().result_for_network_failure(),
            ),
        };
        let checker: Arc<dyn RevocationChecker> = Arc::new(composite);
        Some((checker, deps))
    }

    fn build_composite(
        &self,
        policy: &RevocationCheckPolicy,
        processor: &dyn CertValidationProcessor,
        deps: &mut Dependencies,
    ) -> CompositeRevocationChecker {
        let mut checkers: Vec<Box<dyn RevocationChecker>> = Vec::with_capacity(policy.items.len());

        for item in &policy.items {
            let url = if item.kind.uses_certificate_urls() {
                match UrlSource::pattern(&item.url) {
                    Ok(source) => source,
                    Err(e) => {
                        warn!(
                            policy = %policy.name,
                            pattern = %item.url,
                            error = %e,
                            "Ignoring revocation checker with invalid URL pattern"
                        );
                        continue;
                    }
                }
            } else {
                UrlSource::Static(item.url.clone())
            };

            let trusted_signers = item
                .trusted_signers
                .iter()
                .filter_map(|id| {
                    deps.trusted_certs.push(*id);
                    processor.trusted_cert_by_id(*id).map(|tc| tc.certificate)
                })
                .collect();

            let rules = CheckerRules {
                url,
                allow_issuer_signature: item.allow_issuer_signature,
                trusted_signers,
            };
            let checker: Box<dyn RevocationChecker> = match item.kind {
                RevocationCheckKind::CrlFromCertificate | RevocationCheckKind::CrlFromUrl => {
                    Box::new(CrlRevocationChecker::new(rules, Arc::clone(&self.crl_cache)))
                }
                RevocationCheckKind::OcspFromCertificate | RevocationCheckKind::OcspFromUrl => {
                    Box::new(OcspRevocationChecker::new(rules, Arc::clone(&self.ocsp_cache)))
                }
            };
            checkers.push(checker);
        }

        CompositeRevocationChecker::new(
            checkers,
            policy.result_for_unknown(),
            policy.result_for_network_failure(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use rcgen::{CertificateParams, DnType, KeyPair};

    use crate::error::{CertError, CertResult};
    use crate::pkix::audit::Auditor;
    use crate::pkix::checker::CheckContext;
    use crate::pkix::crl_cache::CrlCacheImpl;
    use crate::pkix::fetch::{MemoryFetcher, UnavailableOcspClient};
    use crate::pkix::ocsp_cache::OcspCacheImpl;
    use crate::pkix::types::{
        CertificateValidationResult, CertificateValidationType, Facility, TrustedCert,
    };

    /// Answers with the default policy, optionally invalidating the
    /// factory while the pipeline is being built.
    struct Lookups<'a> {
        factory: &'a RevocationCheckerFactory,
        invalidate: AtomicBool,
    }

    impl CertValidationProcessor for Lookups<'_> {
        fn check(
            &self,
            _: &[Certificate],
            _: CertificateValidationType,
            _: Option<CertificateValidationType>,
            _: Option<&Facility>,
            _: &dyn Auditor,
        ) -> CertResult<CertificateValidationResult> {
            Err(CertError::Policy("not used".to_string()))
        }

        fn check_in_context(
            &self,
            _: &[Certificate],
            _: CertificateValidationType,
            _: Option<CertificateValidationType>,
            _: Option<&Facility>,
            _: &CheckContext<'_>,
        ) -> CertResult<CertificateValidationResult> {
            Err(CertError::Policy("not used".to_string()))
        }

        fn certificate_by_subject_dn(&self, _: &str) -> Option<Certificate> {
            None
        }

        fn certificate_by_issuer_dn_and_serial(&self, _: &str, _: &[u8]) -> Option<Certificate> {
            None
        }

        fn certificate_by_ski(&self, _: &str) -> Option<Certificate> {
            None
        }

        fn trusted_cert_by_id(&self, _: EntityId) -> Option<TrustedCert> {
            None
        }

        fn trusted_cert_entry(&self, _: &Certificate) -> CertResult<Option<TrustedCert>> {
            Ok(None)
        }

        fn revocation_policy_for(&self, _: &TrustedCert) -> Option<Arc<RevocationCheckPolicy>> {
            None
        }

        fn default_policy(&self) -> Arc<RevocationCheckPolicy> {
            if self.invalidate.swap(false, Ordering::SeqCst) {
                self.factory.invalidate_policy(7);
            }
            let mut policy = RevocationCheckPolicy::fail_closed();
            policy.id = 7;
            Arc::new(policy)
        }
    }

    fn factory() -> RevocationCheckerFactory {
        let config = PkixConfig::default();
        RevocationCheckerFactory::new(
            Arc::new(CrlCacheImpl::new(Arc::new(MemoryFetcher::new()), &config)),
            Arc::new(OcspCacheImpl::new(Arc::new(UnavailableOcspClient), &config)),
            &config,
        )
    }

    fn issuer() -> Certificate {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "Issuer");
        let key = KeyPair::generate().unwrap();
        Certificate::from_der(params.self_signed(&key).unwrap().der().to_vec()).unwrap()
    }

    #[test]
    fn test_checker_built_across_invalidation_is_not_cached() {
        let factory = factory();
        let lookups = Lookups {
            factory: &factory,
            invalidate: AtomicBool::new(true),
        };
        let issuer = issuer();

        factory.revocation_checker(&issuer, &lookups);
        assert_eq!(factory.cached_len(), 0);

        factory.revocation_checker(&issuer, &lookups);
        assert_eq!(factory.cached_len(), 1);
        factory.invalidate_policy(7);
        assert_eq!(factory.cached_len(), 0);
    }

    #[test]
    fn test_cached_checker_is_reused() {
        let factory = factory();
        let lookups = Lookups {
            factory: &factory,
            invalidate: AtomicBool::new(false),
        };
        let issuer = issuer();
        let first = factory.revocation_checker(&issuer, &lookups);
        let second = factory.revocation_checker(&issuer, &lookups);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
