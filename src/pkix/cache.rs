//! Expiring read-through cache shared by the CRL and OCSP caches.
//!
//! One `RwLock` per key: lookups of different keys never wait on each
//! other, and the fetch-or-serve-stale decision for one key happens under
//! that key's write lock.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::audit::{AuditEvent, Auditor};
use crate::config::CacheAges;

struct Cached<V> {
    value: V,
    expires: Instant,
}

type Slot<V> = Arc<RwLock<Option<Cached<V>>>>;

pub(crate) struct ExpiringCache<K, V> {
    what: &'static str,
    ages: CacheAges,
    entries: Mutex<HashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> ExpiringCache<K, V> {
    pub(crate) fn new(what: &'static str, ages: CacheAges) -> Self {
        Self {
            what,
            ages,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &K) -> Slot<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(key.clone()).or_default().clone()
    }

    /// Serve a fresh cached value, or call `fetch` and cache its result.
    ///
    /// `fetch` returns the value and the instant it stops being valid. When
    /// `fetch` fails with an error `may_serve_stale` accepts, an expired
    /// cached value is returned instead; with nothing cached the error
    /// propagates.
    pub(crate) fn get_or_fetch<E: Display>(
        &self,
        key: &K,
        url: &str,
        auditor: &dyn Auditor,
        may_serve_stale: impl Fn(&E) -> bool,
        fetch: impl FnOnce() -> Result<(V, Option<DateTime<Utc>>), E>,
    ) -> Result<V, E> {
        let slot = self.slot(key);

        {
            let entry = slot.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = entry.as_ref().filter(|c| Instant::now() < c.expires) {
                auditor.audit(AuditEvent::RevCacheHit, &[self.what, url]);
                return Ok(cached.value.clone());
            }
        }

        let mut entry = slot.write().unwrap_or_else(|e| e.into_inner());
        // Another caller may have refreshed it while we waited.
        if let Some(cached) = entry.as_ref().filter(|c| Instant::now() < c.expires) {
            auditor.audit(AuditEvent::RevCacheHit, &[self.what, url]);
            return Ok(cached.value.clone());
        }

        auditor.audit(AuditEvent::RevCacheMiss, &[self.what, url]);
        match fetch() {
            Ok((value, valid_until)) => {
                let remaining = valid_until.map(|until| (until - Utc::now()).to_std().unwrap_or(Duration::ZERO));
                let ttl = self.ages.time_to_live(remaining);
                debug!(what = self.what, url, ttl_secs = ttl.as_secs(), "Cached revocation data");
                *entry = Some(Cached {
                    value: value.clone(),
                    expires: Instant::now() + ttl,
                });
                Ok(value)
            }
            Err(e) => match entry.as_ref() {
                Some(stale) if may_serve_stale(&e) => {
                    let reason = e.to_string();
                    warn!(what = self.what, url, error = %reason, "Retrieval failed, using stale cached copy");
                    auditor.audit(AuditEvent::RevCacheStale, &[self.what, url, &reason]);
                    Ok(stale.value.clone())
                }
                _ => Err(e),
            },
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkix::audit::MemoryAuditor;

    fn ages(secs: u64) -> CacheAges {
        CacheAges {
            min: Duration::from_secs(secs),
            max: Duration::from_secs(secs),
            default: Duration::from_secs(secs),
            early_retrieval: Duration::ZERO,
        }
    }

    #[test]
    fn test_fresh_value_is_served_from_cache() {
        let cache: ExpiringCache<String, u32> = ExpiringCache::new("CRL", ages(3600));
        let auditor = MemoryAuditor::new();
        let key = "k".to_string();
        let first = cache.get_or_fetch(&key, "u", &auditor, |_: &String| true, || Ok((1, None)));
        let second = cache.get_or_fetch(&key, "u", &auditor, |_: &String| true, || Ok((2, None)));
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(1));
        assert_eq!(auditor.count(AuditEvent::RevCacheMiss), 1);
        assert_eq!(auditor.count(AuditEvent::RevCacheHit), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stale_fallback_respects_predicate() {
        let cache: ExpiringCache<String, u32> = ExpiringCache::new("OCSP response", ages(0));
        let auditor = MemoryAuditor::new();
        let key = "k".to_string();
        assert_eq!(cache.get_or_fetch(&key, "u", &auditor, |_: &String| true, || Ok((1, None))), Ok(1));
        let stale = cache.get_or_fetch(&key, "u", &auditor, |_: &String| true, || Err("down".to_string()));
        assert_eq!(stale, Ok(1));
        assert!(auditor.contains(AuditEvent::RevCacheStale));
        let refused = cache.get_or_fetch(&key, "u", &auditor, |_: &String| false, || Err("bad".to_string()));
        assert_eq!(refused, Err("bad".to_string()));
    }
}
