//! Certificate validation entry point and the trusted-certificate indexes.
//!
//! [`CertValidationProcessorImpl`] keeps every lookup table in one
//! [`Indexes`] value behind one `RwLock`. Lookups hold the read lock for
//! their whole body; store changes are applied under the write lock, and a
//! change that cannot be applied marks the indexes dirty so the next event
//! rebuilds them from scratch. No lock is held while a path is built or a
//! revocation source is consulted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::audit::{AuditEvent, Auditor};
use super::cert::{trim_serial, Certificate};
use super::checker::CheckContext;
use super::crl_cache::CrlCache;
use super::factory::RevocationCheckerFactory;
use super::ocsp_cache::OcspCache;
use super::path::PathBuilder;
use super::store::{RevocationPolicyStore, TrustedCertStore};
use super::types::{
    CertificateValidationResult, CertificateValidationType, EntityId, EntityInvalidation,
    EntityKind, Facility, InvalidationOp, PolicyRef, RevocationCheckPolicy, TrustedCert,
};
use crate::config::PkixConfig;
use crate::error::{CertError, CertResult as Result, PathError};

/// Validates certificate paths and answers signer lookups for revocation checkers.
pub trait CertValidationProcessor: Send + Sync {
    /// Validate `path` (end-entity first, then any intermediates supplied
    /// with it) at the stronger of `min` and the requested level.
    ///
    /// `requested` falls back to the level configured for `facility`; one
    /// of them must be given. Verdicts are returned as `Ok`; `Err` means the
    /// leaf is expired or not yet valid at certificate-only level, or the
    /// call itself is malformed.
    fn check(
        &self,
        path: &[Certificate],
        min: CertificateValidationType,
        requested: Option<CertificateValidationType>,
        facility: Option<&Facility>,
        auditor: &dyn Auditor,
    ) -> Result<CertificateValidationResult>;

    /// [`CertValidationProcessor::check`] as part of an ongoing check, so
    /// nested OCSP requests share one recursion guard.
    fn check_in_context(
        &self,
        path: &[Certificate],
        min: CertificateValidationType,
        requested: Option<CertificateValidationType>,
        facility: Option<&Facility>,
        ctx: &CheckContext<'_>,
    ) -> Result<CertificateValidationResult>;

    fn certificate_by_subject_dn(&self, subject_dn: &str) -> Option<Certificate>;

    fn certificate_by_issuer_dn_and_serial(&self, issuer_dn: &str, serial: &[u8]) -> Option<Certificate>;

    /// Lookup by base64 subject key identifier.
    fn certificate_by_ski(&self, ski: &str) -> Option<Certificate>;

    fn trusted_cert_by_id(&self, id: EntityId) -> Option<TrustedCert>;

    /// The trusted cert entry for exactly this certificate.
    ///
    /// `Ok(None)` when no trusted cert has its subject DN; an error when
    /// one does but holds a different certificate.
    fn trusted_cert_entry(&self, cert: &Certificate) -> Result<Option<TrustedCert>>;

    /// The policy `trusted` refers to; `None` if a specified policy is missing.
    fn revocation_policy_for(&self, trusted: &TrustedCert) -> Option<Arc<RevocationCheckPolicy>>;

    fn default_policy(&self) -> Arc<RevocationCheckPolicy>;
}

/// Snapshot of one trusted cert, taken when it enters the indexes.
#[derive(Debug)]
struct CacheEntry {
    subject_dn: String,
    issuer_dn: String,
    serial: Vec<u8>,
    ski: String,
    trusted: TrustedCert,
}

impl CacheEntry {
    fn new(trusted: TrustedCert) -> Self {
        let cert = &trusted.certificate;
        Self {
            subject_dn: cert.subject_dn().to_string(),
            issuer_dn: cert.issuer_dn().to_string(),
            serial: cert.serial().to_vec(),
            ski: cert.ski().to_string(),
            trusted,
        }
    }

    fn certificate(&self) -> &Certificate {
        &self.trusted.certificate
    }
}

/// Every lookup table, kept consistent under one lock.
struct Indexes {
    /// Insertion order; the last entry wins a DN collision.
    by_dn: HashMap<String, Vec<Arc<CacheEntry>>>,
    by_issuer_serial: HashMap<(String, Vec<u8>), Arc<CacheEntry>>,
    by_ski: HashMap<String, Arc<CacheEntry>>,
    by_id: HashMap<EntityId, Arc<CacheEntry>>,
    policies: HashMap<EntityId, Arc<RevocationCheckPolicy>>,
    default_policy: Arc<RevocationCheckPolicy>,
    anchors_by_dn: HashMap<String, Certificate>,
    non_anchors: Vec<Certificate>,
    default_anchors: Vec<Certificate>,
    use_default_anchors: bool,
    dirty: bool,
}

impl Indexes {
    fn empty(use_default_anchors: bool, default_anchors: Vec<Certificate>) -> Self {
        Self {
            by_dn: HashMap::new(),
            by_issuer_serial: HashMap::new(),
            by_ski: HashMap::new(),
            by_id: HashMap::new(),
            policies: HashMap::new(),
            default_policy: Arc::new(RevocationCheckPolicy::fail_closed()),
            anchors_by_dn: HashMap::new(),
            non_anchors: Vec::new(),
            default_anchors,
            use_default_anchors,
            dirty: false,
        }
    }

    fn add_trusted(&mut self, trusted: TrustedCert) {
        let entry = Arc::new(CacheEntry::new(trusted));
        self.by_dn
            .entry(entry.subject_dn.clone())
            .or_default()
            .push(Arc::clone(&entry));
        self.by_issuer_serial
            .insert((entry.issuer_dn.clone(), entry.serial.clone()), Arc::clone(&entry));
        self.by_ski.insert(entry.ski.clone(), Arc::clone(&entry));
        self.by_id.insert(entry.trusted.id, entry);
    }

    fn remove_trusted(&mut self, id: EntityId) -> Option<Arc<CacheEntry>> {
        let entry = self.by_id.remove(&id)?;
        if let Some(list) = self.by_dn.get_mut(&entry.subject_dn) {
            list.retain(|e| e.trusted.id != id);
            if list.is_empty() {
                self.by_dn.remove(&entry.subject_dn);
            }
        }
        let key = (entry.issuer_dn.clone(), entry.serial.clone());
        if self.by_issuer_serial.get(&key).is_some_and(|e| e.trusted.id == id) {
            self.by_issuer_serial.remove(&key);
        }
        if self.by_ski.get(&entry.ski).is_some_and(|e| e.trusted.id == id) {
            self.by_ski.remove(&entry.ski);
        }
        Some(entry)
    }

    /// Returns true when the default policy changed identity.
    fn add_policy(&mut self, policy: RevocationCheckPolicy) -> bool {
        let id = policy.id;
        let policy = Arc::new(policy);
        let mut default_changed = false;
        if policy.default_policy {
            default_changed = self.default_policy.id != id;
            self.default_policy = Arc::clone(&policy);
        } else if self.default_policy.id == id {
            self.default_policy = Arc::new(RevocationCheckPolicy::fail_closed());
            default_changed = true;
        }
        self.policies.insert(id, policy);
        default_changed
    }

    /// Returns true when the default policy was removed.
    fn remove_policy(&mut self, id: EntityId) -> bool {
        self.policies.remove(&id);
        if self.default_policy.id == id && !self.default_policy.is_builtin() {
            debug!(policy = id, "Default revocation policy deleted");
            self.default_policy = Arc::new(RevocationCheckPolicy::fail_closed());
            return true;
        }
        false
    }

    /// Recompute the anchor / non-anchor partition: own CA, then default
    /// anchors (if enabled), then trusted anchors by id. Later entries win
    /// a DN collision.
    fn rebuild_anchors(&mut self, own_ca: &[Certificate]) {
        let mut anchors = HashMap::new();
        for cert in own_ca {
            anchors.insert(cert.subject_dn().to_string(), cert.clone());
        }
        if self.use_default_anchors {
            for cert in &self.default_anchors {
                anchors.insert(cert.subject_dn().to_string(), cert.clone());
            }
        }

        let mut trusted: Vec<&Arc<CacheEntry>> = self.by_id.values().collect();
        trusted.sort_by_key(|e| e.trusted.id);
        let mut non_anchors = Vec::new();
        for entry in trusted {
            if entry.trusted.trust_anchor {
                anchors.insert(entry.subject_dn.clone(), entry.certificate().clone());
            } else {
                non_anchors.push(entry.certificate().clone());
            }
        }

        self.anchors_by_dn = anchors;
        self.non_anchors = non_anchors;
    }

    fn anchor_where(&self, pred: impl Fn(&Certificate) -> bool) -> Option<Certificate> {
        self.anchors_by_dn.values().find(|c| pred(c)).cloned()
    }
}

pub struct CertValidationProcessorImpl {
    cert_store: Arc<dyn TrustedCertStore>,
    policy_store: Arc<dyn RevocationPolicyStore>,
    own_ca: Vec<Certificate>,
    config: PkixConfig,
    permissive: Arc<RevocationCheckPolicy>,
    factory: RevocationCheckerFactory,
    indexes: RwLock<Indexes>,
}

impl CertValidationProcessorImpl {
    /// Create the processor and populate its indexes from the stores.
    pub fn new(
        cert_store: Arc<dyn TrustedCertStore>,
        policy_store: Arc<dyn RevocationPolicyStore>,
        crl_cache: Arc<dyn CrlCache>,
        ocsp_cache: Arc<dyn OcspCache>,
        own_ca: Vec<Certificate>,
        config: PkixConfig,
    ) -> Result<Self> {
        let default_anchors = if config.use_default_anchors {
            load_default_anchors()
        } else {
            Vec::new()
        };
        let processor = Self {
            cert_store,
            policy_store,
            own_ca,
            permissive: Arc::new(RevocationCheckPolicy::permissive()),
            factory: RevocationCheckerFactory::new(crl_cache, ocsp_cache, &config),
            indexes: RwLock::new(Indexes::empty(config.use_default_anchors, default_anchors)),
            config,
        };
        processor.populate_caches()?;
        Ok(processor)
    }

    pub fn factory(&self) -> &RevocationCheckerFactory {
        &self.factory
    }

    /// True after a store change failed to apply; the next event rebuilds.
    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    pub fn trust_anchors(&self) -> Vec<Certificate> {
        self.read().anchors_by_dn.values().cloned().collect()
    }

    /// Rebuild every index from the stores.
    ///
    /// More than one default policy is an error and leaves the current
    /// indexes untouched. With no default policy, a fail-closed stand-in is
    /// used.
    pub fn populate_caches(&self) -> Result<()> {
        info!("(Re-)Populating certificate validation caches");
        let policies = self.policy_store.find_all()?;
        let trusted = self.cert_store.find_all()?;

        let (use_defaults, default_anchors) = {
            let current = self.read();
            (current.use_default_anchors, current.default_anchors.clone())
        };
        let mut fresh = Indexes::empty(use_defaults, default_anchors);

        let mut default_seen = false;
        for policy in policies {
            if policy.default_policy {
                if default_seen {
                    return Err(CertError::Policy(
                        "Multiple revocation check policies are flagged as default".to_string(),
                    ));
                }
                default_seen = true;
            }
            fresh.add_policy(policy);
        }
        for tc in trusted {
            fresh.add_trusted(tc);
        }
        fresh.rebuild_anchors(&self.own_ca);

        let anchors = fresh.anchors_by_dn.len();
        let certs = fresh.by_id.len();
        *self.write() = fresh;
        self.factory.invalidate_all();
        debug!(certs, anchors, "Certificate validation caches populated");
        Ok(())
    }

    /// Apply a store change notification.
    pub fn on_invalidation(&self, event: &EntityInvalidation) {
        if self.read().dirty {
            if let Err(e) = self.populate_caches() {
                warn!(error = %e, "Full rebuild of certificate validation caches failed");
            }
            return;
        }
        match event.kind {
            EntityKind::TrustedCert => self.apply_trusted_cert_changes(&event.changes),
            EntityKind::Policy => self.apply_policy_changes(&event.changes),
        }
    }

    fn apply_trusted_cert_changes(&self, changes: &[(EntityId, InvalidationOp)]) {
        // Fetch before locking; stores may be slow.
        let fetched: Vec<(EntityId, Result<Option<TrustedCert>>)> = changes
            .iter()
            .map(|&(id, op)| match op {
                InvalidationOp::Delete => (id, Ok(None)),
                InvalidationOp::Create | InvalidationOp::Update => (id, self.cert_store.find_by_id(id)),
            })
            .collect();

        let mut idx = self.write();
        for (id, result) in fetched {
            match result {
                Ok(Some(tc)) => {
                    let cert = tc.certificate.clone();
                    idx.remove_trusted(id);
                    idx.add_trusted(tc);
                    self.factory.invalidate_trusted_cert(id, Some(&cert));
                    debug!(trusted_cert = id, subject = cert.subject_dn(), "Trusted certificate cached");
                }
                Ok(None) => {
                    let removed = idx.remove_trusted(id);
                    self.factory
                        .invalidate_trusted_cert(id, removed.as_ref().map(|e| e.certificate()));
                    debug!(trusted_cert = id, "Trusted certificate removed from cache");
                }
                Err(e) => {
                    idx.dirty = true;
                    warn!(trusted_cert = id, error = %e, "Couldn't load recently created or updated trusted certificate");
                }
            }
        }
        idx.rebuild_anchors(&self.own_ca);
    }

    fn apply_policy_changes(&self, changes: &[(EntityId, InvalidationOp)]) {
        let fetched: Vec<(EntityId, Result<Option<RevocationCheckPolicy>>)> = changes
            .iter()
            .map(|&(id, op)| match op {
                InvalidationOp::Delete => (id, Ok(None)),
                InvalidationOp::Create | InvalidationOp::Update => (id, self.policy_store.find_by_id(id)),
            })
            .collect();

        let mut idx = self.write();
        for (id, result) in fetched {
            let default_changed = match result {
                Ok(Some(policy)) => idx.add_policy(policy),
                Ok(None) => idx.remove_policy(id),
                Err(e) => {
                    idx.dirty = true;
                    warn!(policy = id, error = %e, "Couldn't load recently created or updated revocation policy");
                    continue;
                }
            };
            self.factory.invalidate_policy(id);
            if default_changed {
                self.factory.invalidate_all();
            }
        }
    }

    /// Switch the platform trust anchors on or off.
    pub fn set_use_default_anchors(&self, enabled: bool) {
        let loaded = if enabled { load_default_anchors() } else { Vec::new() };
        let mut idx = self.write();
        idx.use_default_anchors = enabled;
        idx.default_anchors = loaded;
        idx.rebuild_anchors(&self.own_ca);
        debug!(enabled, anchors = idx.anchors_by_dn.len(), "Updated trust anchors");
    }

    fn resolve_level(
        &self,
        min: CertificateValidationType,
        requested: Option<CertificateValidationType>,
        facility: Option<&Facility>,
        auditor: &dyn Auditor,
    ) -> Result<CertificateValidationType> {
        use CertificateValidationType::*;

        let level = match (requested, facility) {
            (Some(level), _) => level,
            (None, Some(facility)) => match self.config.facilities.get(facility.name()) {
                None => {
                    warn!(facility = facility.name(), "No validation setting for facility, using validate");
                    CertificateOnly
                }
                Some(setting) => CertificateValidationType::from_setting(setting).unwrap_or_else(|| {
                    auditor.audit(AuditEvent::InvalidSetting, &[facility.name(), setting]);
                    Revocation
                }),
            },
            (None, None) => {
                return Err(CertError::Policy(
                    "Either a requested validation type or a facility must be provided".to_string(),
                ))
            }
        };
        Ok(CertificateValidationType::effective(min, level))
    }

    fn check_certificate_only(&self, cert: &Certificate, auditor: &dyn Auditor) -> Result<CertificateValidationResult> {
        match cert.check_validity(Utc::now()) {
            Ok(()) => {
                auditor.audit(AuditEvent::Checked, &[]);
                Ok(CertificateValidationResult::Ok)
            }
            Err(e) => {
                let event = match e {
                    CertError::NotYetValid { .. } => AuditEvent::CertNotYetValid,
                    _ => AuditEvent::CertExpired,
                };
                auditor.audit(event, &[cert.subject_dn()]);
                Err(e)
            }
        }
    }

    fn path_builder(&self) -> PathBuilder {
        let idx = self.read();
        PathBuilder::new(
            idx.anchors_by_dn.values().cloned().collect(),
            idx.non_anchors.clone(),
        )
        .permit_critical(self.config.permitted_critical_extensions.iter().cloned())
    }

    fn read(&self) -> RwLockReadGuard<'_, Indexes> {
        self.indexes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indexes> {
        self.indexes.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl CertValidationProcessor for CertValidationProcessorImpl {
    fn check(
        &self,
        path: &[Certificate],
        min: CertificateValidationType,
        requested: Option<CertificateValidationType>,
        facility: Option<&Facility>,
        auditor: &dyn Auditor,
    ) -> Result<CertificateValidationResult> {
        let ctx = CheckContext::new(auditor, self);
        self.check_in_context(path, min, requested, facility, &ctx)
    }

    fn check_in_context(
        &self,
        path: &[Certificate],
        min: CertificateValidationType,
        requested: Option<CertificateValidationType>,
        facility: Option<&Facility>,
        ctx: &CheckContext<'_>,
    ) -> Result<CertificateValidationResult> {
        let auditor = ctx.auditor();
        let Some((target, supplied)) = path.split_first() else {
            return Err(CertError::Parse("invalid certificate path: no certificates".to_string()));
        };
        let level = self.resolve_level(min, requested, facility, auditor)?;
        let subject = target.subject_dn();
        debug!(subject, level = level.as_setting(), "Validating certificate");

        if level == CertificateValidationType::CertificateOnly {
            return self.check_certificate_only(target, auditor);
        }

        let builder = self.path_builder();
        let outcome = if level == CertificateValidationType::Revocation {
            let mut check_edge = |cert: &Certificate, issuer: &Certificate| -> std::result::Result<(), PathError> {
                let checker = self.factory.revocation_checker(issuer, self);
                match checker.revocation_status(cert, issuer, ctx, CertificateValidationResult::Revoked) {
                    CertificateValidationResult::Revoked | CertificateValidationResult::CantBuildPath => {
                        Err(PathError::Revoked(cert.subject_dn().to_string()))
                    }
                    CertificateValidationResult::Ok | CertificateValidationResult::Unknown => Ok(()),
                }
            };
            builder.build(target, supplied, Some(&mut check_edge))
        } else {
            builder.build(target, supplied, None)
        };

        match outcome {
            Ok(chain) => {
                debug!(subject, length = chain.len(), "Certificate path built");
                auditor.audit(AuditEvent::Checked, &[]);
                Ok(CertificateValidationResult::Ok)
            }
            Err(e) => {
                match &e {
                    PathError::Expired { .. } => auditor.audit(AuditEvent::CertExpired, &[subject]),
                    PathError::NotYetValid { .. } => auditor.audit(AuditEvent::CertNotYetValid, &[subject]),
                    other => auditor.audit(AuditEvent::CantBuildPath, &[subject, &other.to_string()]),
                }
                Ok(CertificateValidationResult::CantBuildPath)
            }
        }
    }

    fn certificate_by_subject_dn(&self, subject_dn: &str) -> Option<Certificate> {
        let idx = self.read();
        match idx.by_dn.get(subject_dn).and_then(|list| list.last()) {
            Some(entry) => Some(entry.certificate().clone()),
            None => idx.anchors_by_dn.get(subject_dn).cloned(),
        }
    }

    fn certificate_by_issuer_dn_and_serial(&self, issuer_dn: &str, serial: &[u8]) -> Option<Certificate> {
        let serial = trim_serial(serial);
        let idx = self.read();
        match idx.by_issuer_serial.get(&(issuer_dn.to_string(), serial.to_vec())) {
            Some(entry) => Some(entry.certificate().clone()),
            None => idx.anchor_where(|c| c.issuer_dn() == issuer_dn && c.serial() == serial),
        }
    }

    fn certificate_by_ski(&self, ski: &str) -> Option<Certificate> {
        let idx = self.read();
        match idx.by_ski.get(ski) {
            Some(entry) => Some(entry.certificate().clone()),
            None => idx.anchor_where(|c| c.ski() == ski),
        }
    }

    fn trusted_cert_by_id(&self, id: EntityId) -> Option<TrustedCert> {
        self.read().by_id.get(&id).map(|e| e.trusted.clone())
    }

    fn trusted_cert_entry(&self, cert: &Certificate) -> Result<Option<TrustedCert>> {
        let idx = self.read();
        let Some(list) = idx.by_dn.get(cert.subject_dn()) else {
            return Ok(None);
        };
        list.iter()
            .rev()
            .find(|e| e.certificate() == cert)
            .map(|e| Some(e.trusted.clone()))
            .ok_or_else(|| {
                CertError::Store(format!(
                    "Cached trusted certificate with DN {} is different from presented certificate",
                    cert.subject_dn()
                ))
            })
    }

    fn revocation_policy_for(&self, trusted: &TrustedCert) -> Option<Arc<RevocationCheckPolicy>> {
        match trusted.revocation_policy {
            PolicyRef::None => Some(Arc::clone(&self.permissive)),
            PolicyRef::UseDefault => Some(Arc::clone(&self.read().default_policy)),
            PolicyRef::Specified(id) => self.read().policies.get(&id).cloned(),
        }
    }

    fn default_policy(&self) -> Arc<RevocationCheckPolicy> {
        Arc::clone(&self.read().default_policy)
    }
}

/// Platform root certificates. Entries that fail to parse are skipped.
fn load_default_anchors() -> Vec<Certificate> {
    let ders = match rustls_native_certs::load_native_certs() {
        Ok(ders) => ders,
        Err(e) => {
            warn!(error = %e, "Couldn't load platform trust anchors");
            return Vec::new();
        }
    };
    let total = ders.len();
    let anchors: Vec<Certificate> = ders
        .into_iter()
        .filter_map(|der| Certificate::from_der(der.as_ref().to_vec()).ok())
        .collect();
    debug!(loaded = anchors.len(), skipped = total - anchors.len(), "Loaded platform trust anchors");
    anchors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkix::audit::MemoryAuditor;
    use crate::pkix::crl_cache::CrlCacheImpl;
    use crate::pkix::fetch::{MemoryFetcher, UnavailableOcspClient};
    use crate::pkix::ocsp_cache::OcspCacheImpl;
    use crate::pkix::store::{MemoryPolicyStore, MemoryTrustedCertStore};
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    fn self_signed(cn: &str) -> Certificate {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let key = KeyPair::generate().unwrap();
        Certificate::from_der(params.self_signed(&key).unwrap().der().to_vec()).unwrap()
    }

    fn processor(
        certs: Arc<MemoryTrustedCertStore>,
        policies: Arc<MemoryPolicyStore>,
        config: PkixConfig,
    ) -> Result<CertValidationProcessorImpl> {
        let crl = Arc::new(CrlCacheImpl::new(Arc::new(MemoryFetcher::new()), &config));
        let ocsp = Arc::new(OcspCacheImpl::new(Arc::new(UnavailableOcspClient), &config));
        CertValidationProcessorImpl::new(certs, policies, crl, ocsp, Vec::new(), config)
    }

    fn trusted(id: EntityId, cert: Certificate, anchor: bool) -> TrustedCert {
        TrustedCert {
            id,
            name: format!("cert {id}"),
            certificate: cert,
            trust_anchor: anchor,
            revocation_policy: PolicyRef::UseDefault,
        }
    }

    #[test]
    fn test_two_default_policies_is_an_error() {
        let policies = Arc::new(MemoryPolicyStore::new());
        for id in [1, 2] {
            let mut p = RevocationCheckPolicy::fail_closed();
            p.id = id;
            policies.put(p);
        }
        let result = processor(Arc::new(MemoryTrustedCertStore::new()), policies, PkixConfig::default());
        assert!(matches!(result, Err(CertError::Policy(_))));
    }

    #[test]
    fn test_missing_default_policy_fails_closed() {
        let p = processor(
            Arc::new(MemoryTrustedCertStore::new()),
            Arc::new(MemoryPolicyStore::new()),
            PkixConfig::default(),
        )
        .unwrap();
        let policy = p.default_policy();
        assert!(policy.is_builtin());
        assert_eq!(policy.result_for_unknown(), CertificateValidationResult::Revoked);
    }

    #[test]
    fn test_lookups_prefer_trusted_index_then_anchors() {
        let certs = Arc::new(MemoryTrustedCertStore::new());
        let anchor = self_signed("Anchor");
        let plain = self_signed("Plain");
        certs.put(trusted(1, anchor.clone(), true));
        certs.put(trusted(2, plain.clone(), false));
        let p = processor(certs, Arc::new(MemoryPolicyStore::new()), PkixConfig::default()).unwrap();

        assert_eq!(p.certificate_by_subject_dn(anchor.subject_dn()), Some(anchor.clone()));
        assert_eq!(p.certificate_by_ski(plain.ski()), Some(plain.clone()));
        assert_eq!(
            p.certificate_by_issuer_dn_and_serial(plain.issuer_dn(), plain.serial()),
            Some(plain.clone())
        );
        assert_eq!(p.trust_anchors(), vec![anchor.clone()]);
        assert_eq!(p.trusted_cert_by_id(2).map(|t| t.certificate), Some(plain));
        assert!(p.certificate_by_subject_dn("CN=Nobody").is_none());
    }

    #[test]
    fn test_trusted_cert_entry_rejects_dn_impostor() {
        let certs = Arc::new(MemoryTrustedCertStore::new());
        let real = self_signed("Same Name");
        let impostor = self_signed("Same Name");
        certs.put(trusted(1, real.clone(), false));
        let p = processor(certs, Arc::new(MemoryPolicyStore::new()), PkixConfig::default()).unwrap();
        assert_eq!(p.trusted_cert_entry(&real).unwrap().map(|t| t.id), Some(1));
        assert!(p.trusted_cert_entry(&impostor).is_err());
        assert!(p.trusted_cert_entry(&self_signed("Other")).unwrap().is_none());
    }

    #[test]
    fn test_facility_setting_resolution() {
        let mut config = PkixConfig::default();
        config.facilities.insert("routing".into(), "validatepath".into());
        config.facilities.insert("identity".into(), "bogus".into());
        let p = processor(
            Arc::new(MemoryTrustedCertStore::new()),
            Arc::new(MemoryPolicyStore::new()),
            config,
        )
        .unwrap();
        let auditor = MemoryAuditor::new();
        use CertificateValidationType::*;

        let level = |min, facility: Facility| p.resolve_level(min, None, Some(&facility), &auditor).unwrap();
        assert_eq!(level(CertificateOnly, Facility::Routing), PathValidation);
        assert_eq!(level(CertificateOnly, Facility::Other("ftp".into())), CertificateOnly);
        assert_eq!(level(PathValidation, Facility::Other("ftp".into())), PathValidation);
        assert!(!auditor.contains(AuditEvent::InvalidSetting));
        assert_eq!(level(CertificateOnly, Facility::Identity), Revocation);
        assert!(auditor.contains(AuditEvent::InvalidSetting));
        assert!(p.resolve_level(CertificateOnly, None, None, &auditor).is_err());
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let p = processor(
            Arc::new(MemoryTrustedCertStore::new()),
            Arc::new(MemoryPolicyStore::new()),
            PkixConfig::default(),
        )
        .unwrap();
        let auditor = MemoryAuditor::new();
        assert!(p
            .check(&[], CertificateValidationType::CertificateOnly, Some(CertificateValidationType::PathValidation), None, &auditor)
            .is_err());
    }
}
