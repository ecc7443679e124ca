//! Read-only views of the trusted-certificate and revocation-policy stores.
//!
//! The validation core only reads these. Persistence lives elsewhere; the
//! in-memory stores here back the CLI and tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::types::{EntityId, RevocationCheckPolicy, TrustedCert};
use crate::error::CertResult as Result;

pub trait TrustedCertStore: Send + Sync {
    fn find_all(&self) -> Result<Vec<TrustedCert>>;

    /// `Ok(None)` when the id is unknown (for example after a delete).
    fn find_by_id(&self, id: EntityId) -> Result<Option<TrustedCert>>;
}

pub trait RevocationPolicyStore: Send + Sync {
    fn find_all(&self) -> Result<Vec<RevocationCheckPolicy>>;

    fn find_by_id(&self, id: EntityId) -> Result<Option<RevocationCheckPolicy>>;
}

#[derive(Debug, Default)]
pub struct MemoryTrustedCertStore {
    certs: RwLock<BTreeMap<EntityId, TrustedCert>>,
}

impl MemoryTrustedCertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, cert: TrustedCert) {
        self.certs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cert.id, cert);
    }

    pub fn remove(&self, id: EntityId) -> Option<TrustedCert> {
        self.certs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }
}

impl TrustedCertStore for MemoryTrustedCertStore {
    fn find_all(&self) -> Result<Vec<TrustedCert>> {
        Ok(self
            .certs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn find_by_id(&self, id: EntityId) -> Result<Option<TrustedCert>> {
        Ok(self
            .certs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    policies: RwLock<BTreeMap<EntityId, RevocationCheckPolicy>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, policy: RevocationCheckPolicy) {
        self.policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(policy.id, policy);
    }

    pub fn remove(&self, id: EntityId) -> Option<RevocationCheckPolicy> {
        self.policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }
}

impl RevocationPolicyStore for MemoryPolicyStore {
    fn find_all(&self) -> Result<Vec<RevocationCheckPolicy>> {
        Ok(self
            .policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn find_by_id(&self, id: EntityId) -> Result<Option<RevocationCheckPolicy>> {
        Ok(self
            .policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_store_put_find_remove() {
        let store = MemoryPolicyStore::new();
        let mut policy = RevocationCheckPolicy::permissive();
        policy.id = 7;
        store.put(policy.clone());
        assert_eq!(store.find_by_id(7).unwrap(), Some(policy));
        assert_eq!(store.find_all().unwrap().len(), 1);
        assert!(store.remove(7).is_some());
        assert_eq!(store.find_by_id(7).unwrap(), None);
    }
}
