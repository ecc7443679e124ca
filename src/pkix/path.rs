//! Certification path building.
//!
//! Depth-first search from the target certificate, through the supplied
//! intermediates, to any trust anchor. Every edge is checked for name
//! chaining, CA status and signature; every non-anchor certificate for
//! validity and critical extensions. An optional revocation callback runs
//! for each (certificate, issuer) edge before it is accepted.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::trace;

use super::cert::Certificate;
use crate::error::{CertError, PathError};

/// Longest chain tried, anchor included.
const MAX_PATH_LEN: usize = 10;

/// Critical extensions every path validation understands. Name and policy
/// constraints are not enforced, so a certificate marking them critical
/// is rejected unless the caller permits the OID.
const KNOWN_CRITICAL_EXTENSIONS: &[&str] = &[
    "2.5.29.14", // subjectKeyIdentifier
    "2.5.29.15", // keyUsage
    "2.5.29.17", // subjectAltName
    "2.5.29.18", // issuerAltName
    "2.5.29.19", // basicConstraints
    "2.5.29.31", // cRLDistributionPoints
    "2.5.29.32", // certificatePolicies
    "2.5.29.35", // authorityKeyIdentifier
    "2.5.29.37", // extKeyUsage
    "2.5.29.46", // freshestCRL
    "1.3.6.1.5.5.7.1.1",   // authorityInfoAccess
    "1.3.6.1.5.5.7.48.1.5", // ocspNoCheck
];

/// Revocation hook: `(cert, issuer)` for each edge of a candidate path.
pub type RevocationCallback<'a> = dyn FnMut(&Certificate, &Certificate) -> Result<(), PathError> + 'a;

pub struct PathBuilder {
    anchors: Vec<Certificate>,
    intermediates: Vec<Certificate>,
    at: DateTime<Utc>,
    permitted_critical: HashSet<String>,
}

impl PathBuilder {
    pub fn new(anchors: Vec<Certificate>, intermediates: Vec<Certificate>) -> Self {
        Self {
            anchors,
            intermediates,
            at: Utc::now(),
            permitted_critical: KNOWN_CRITICAL_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Validate as of `at` instead of now.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    /// Accept these critical extension OIDs in addition to the built-in set.
    pub fn permit_critical<I, S>(mut self, oids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permitted_critical.extend(oids.into_iter().map(Into::into));
        self
    }

    /// Build a path from `target` to a trust anchor.
    ///
    /// `extra` are intermediates supplied with this request, tried before
    /// the builder's own. The returned chain starts with `target` and ends
    /// with the anchor.
    pub fn build(
        &self,
        target: &Certificate,
        extra: &[Certificate],
        mut revocation: Option<&mut RevocationCallback<'_>>,
    ) -> Result<Vec<Certificate>, PathError> {
        self.check_certificate(target)?;

        if self.anchors.contains(target) {
            return Ok(vec![target.clone()]);
        }

        let intermediates: Vec<&Certificate> = extra.iter().chain(self.intermediates.iter()).collect();
        let mut chain = vec![target.clone()];
        let mut best_error = None;

        if self.extend(&mut chain, &intermediates, &mut revocation, &mut best_error) {
            return Ok(chain);
        }
        Err(best_error.unwrap_or_else(|| PathError::NoPath(target.subject_dn().to_string())))
    }

    /// Try to finish `chain` from its last element. On success the chain
    /// ends with an anchor.
    fn extend(
        &self,
        chain: &mut Vec<Certificate>,
        intermediates: &[&Certificate],
        revocation: &mut Option<&mut RevocationCallback<'_>>,
        best_error: &mut Option<PathError>,
    ) -> bool {
        let Some(current) = chain.last().cloned() else {
            return false;
        };
        // Intermediates between the next issuer and the target.
        let below = chain.len() - 1;

        for anchor in self.anchors.iter().filter(|a| issues(a, &current)) {
            if current.verify_signed_by(anchor).is_err() {
                trace!(subject = current.subject_dn(), anchor = anchor.subject_dn(), "Anchor signature mismatch");
                continue;
            }
            if let Err(e) = check_issuer(anchor, below) {
                remember(best_error, e);
                continue;
            }
            if let Err(e) = run_revocation(revocation, &current, anchor) {
                remember(best_error, e);
                continue;
            }
            chain.push(anchor.clone());
            return true;
        }

        if chain.len() + 1 >= MAX_PATH_LEN {
            return false;
        }

        for &candidate in intermediates {
            if !issues(candidate, &current) || !candidate.is_ca() || chain.contains(candidate) {
                continue;
            }
            if current.verify_signed_by(candidate).is_err() {
                continue;
            }
            if let Err(e) = self
                .check_certificate(candidate)
                .and_then(|()| check_issuer(candidate, below))
            {
                remember(best_error, e);
                continue;
            }
            if let Err(e) = run_revocation(revocation, &current, candidate) {
                remember(best_error, e);
                continue;
            }
            chain.push(candidate.clone());
            if self.extend(chain, intermediates, revocation, best_error) {
                return true;
            }
            chain.pop();
        }
        false
    }

    fn check_certificate(&self, cert: &Certificate) -> Result<(), PathError> {
        match cert.check_validity(self.at) {
            Ok(()) => {}
            Err(CertError::Expired { subject, not_after }) => {
                return Err(PathError::Expired { subject, not_after })
            }
            Err(CertError::NotYetValid { subject, not_before }) => {
                return Err(PathError::NotYetValid { subject, not_before })
            }
            Err(other) => return Err(PathError::NoPath(other.to_string())),
        }
        if let Some(oid) = cert
            .critical_extension_oids()
            .iter()
            .find(|oid| !self.permitted_critical.contains(oid.as_str()))
        {
            return Err(PathError::UnsupportedCriticalExtension {
                subject: cert.subject_dn().to_string(),
                oid: oid.clone(),
            });
        }
        Ok(())
    }
}

/// Key usage and path length limits of a certificate acting as issuer
/// with `below` intermediates under it.
fn check_issuer(issuer: &Certificate, below: usize) -> Result<(), PathError> {
    let reason = if !issuer.allows_key_cert_sign() {
        "key usage does not permit keyCertSign".to_string()
    } else {
        match issuer.path_len_constraint() {
            Some(limit) if below > limit as usize => {
                format!("path length constraint {limit} exceeded by {below} intermediates")
            }
            _ => return Ok(()),
        }
    };
    Err(PathError::IssuerNotPermitted {
        subject: issuer.subject_dn().to_string(),
        reason,
    })
}

fn issues(issuer: &Certificate, cert: &Certificate) -> bool {
    issuer.subject_raw() == cert.issuer_raw()
}

fn run_revocation(
    revocation: &mut Option<&mut RevocationCallback<'_>>,
    cert: &Certificate,
    issuer: &Certificate,
) -> Result<(), PathError> {
    match revocation {
        Some(check) => check(cert, issuer),
        None => Ok(()),
    }
}

/// Keep the first specific failure.
fn remember(best: &mut Option<PathError>, error: PathError) {
    if best.is_none() {
        *best = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, CustomExtension, DnType, GeneralSubtree, IsCa, KeyPair,
        KeyUsagePurpose, NameConstraints,
    };

    struct Issued {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    fn root(cn: &str) -> Issued {
        root_with(cn, BasicConstraints::Unconstrained)
    }

    fn root_with(cn: &str, constraints: BasicConstraints) -> Issued {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(constraints);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Issued { cert, key }
    }

    fn issue(cn: &str, ca: bool, by: &Issued, tweak: impl FnOnce(&mut CertificateParams)) -> Issued {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        if ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        }
        tweak(&mut params);
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &by.cert, &by.key).unwrap();
        Issued { cert, key }
    }

    fn parsed(i: &Issued) -> Certificate {
        Certificate::from_der(i.cert.der().to_vec()).unwrap()
    }

    #[test]
    fn test_builds_through_intermediate() {
        let ca = root("Root");
        let mid = issue("Intermediate", true, &ca, |_| {});
        let leaf = issue("Leaf", false, &mid, |_| {});
        let builder = PathBuilder::new(vec![parsed(&ca)], vec![parsed(&mid)]);
        let chain = builder.build(&parsed(&leaf), &[], None).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[2], parsed(&ca));
    }

    #[test]
    fn test_no_anchor_is_no_path() {
        let ca = root("Root");
        let other = root("Other Root");
        let leaf = issue("Leaf", false, &ca, |_| {});
        let builder = PathBuilder::new(vec![parsed(&other)], Vec::new());
        assert!(matches!(
            builder.build(&parsed(&leaf), &[], None),
            Err(PathError::NoPath(_))
        ));
    }

    #[test]
    fn test_non_ca_intermediate_is_rejected() {
        let ca = root("Root");
        let mid = issue("Not A CA", false, &ca, |_| {});
        let leaf = issue("Leaf", false, &mid, |_| {});
        let builder = PathBuilder::new(vec![parsed(&ca)], vec![parsed(&mid)]);
        assert!(builder.build(&parsed(&leaf), &[], None).is_err());
    }

    #[test]
    fn test_expired_target() {
        let ca = root("Root");
        let leaf = issue("Leaf", false, &ca, |_| {});
        let builder = PathBuilder::new(vec![parsed(&ca)], Vec::new())
            .at(Utc::now() + chrono::Duration::days(365 * 5000));
        assert!(matches!(
            builder.build(&parsed(&leaf), &[], None),
            Err(PathError::Expired { .. })
        ));
    }

    #[test]
    fn test_revocation_callback_sees_every_edge() {
        let ca = root("Root");
        let mid = issue("Intermediate", true, &ca, |_| {});
        let leaf = issue("Leaf", false, &mid, |_| {});
        let builder = PathBuilder::new(vec![parsed(&ca)], Vec::new());
        let mut edges = Vec::new();
        let mut record = |cert: &Certificate, issuer: &Certificate| -> Result<(), PathError> {
            edges.push((cert.subject_dn().to_string(), issuer.subject_dn().to_string()));
            Ok(())
        };
        builder
            .build(&parsed(&leaf), &[parsed(&mid)], Some(&mut record))
            .unwrap();
        assert_eq!(edges.len(), 2);

        let mut reject = |cert: &Certificate, _: &Certificate| -> Result<(), PathError> {
            Err(PathError::Revoked(cert.subject_dn().to_string()))
        };
        assert!(matches!(
            builder.build(&parsed(&leaf), &[parsed(&mid)], Some(&mut reject)),
            Err(PathError::Revoked(_))
        ));
    }

    #[test]
    fn test_unknown_critical_extension() {
        let ca = root("Root");
        let leaf = issue("Leaf", false, &ca, |p| {
            let mut ext = CustomExtension::from_oid_content(&[1, 2, 3, 4, 5], vec![0x05, 0x00]);
            ext.set_criticality(true);
            p.custom_extensions.push(ext);
        });
        let strict = PathBuilder::new(vec![parsed(&ca)], Vec::new());
        assert!(matches!(
            strict.build(&parsed(&leaf), &[], None),
            Err(PathError::UnsupportedCriticalExtension { .. })
        ));
        let lenient = PathBuilder::new(vec![parsed(&ca)], Vec::new()).permit_critical(["1.2.3.4.5"]);
        assert!(lenient.build(&parsed(&leaf), &[], None).is_ok());
    }

    #[test]
    fn test_path_length_constraint_enforced() {
        let ca = root_with("Root", BasicConstraints::Constrained(0));
        let mid = issue("Intermediate", true, &ca, |_| {});
        let leaf = issue("Leaf", false, &mid, |_| {});
        let builder = PathBuilder::new(vec![parsed(&ca)], vec![parsed(&mid)]);
        assert!(matches!(
            builder.build(&parsed(&leaf), &[], None),
            Err(PathError::IssuerNotPermitted { .. })
        ));

        let direct = issue("Direct Leaf", false, &ca, |_| {});
        assert_eq!(builder.build(&parsed(&direct), &[], None).unwrap().len(), 2);

        // The limit applies to intermediates too.
        let open = root("Open Root");
        let mid = issue("Limited", true, &open, |p| p.is_ca = IsCa::Ca(BasicConstraints::Constrained(0)));
        let inner = issue("Inner", true, &mid, |_| {});
        let leaf = issue("Deep Leaf", false, &inner, |_| {});
        let builder = PathBuilder::new(vec![parsed(&open)], Vec::new());
        assert!(matches!(
            builder.build(&parsed(&leaf), &[parsed(&inner), parsed(&mid)], None),
            Err(PathError::IssuerNotPermitted { .. })
        ));
        assert!(builder.build(&parsed(&inner), &[parsed(&mid)], None).is_ok());
    }

    #[test]
    fn test_intermediate_without_key_cert_sign_is_rejected() {
        let ca = root("Root");
        let mid = issue("Signing Only", true, &ca, |p| {
            p.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        });
        let leaf = issue("Leaf", false, &mid, |_| {});
        let builder = PathBuilder::new(vec![parsed(&ca)], vec![parsed(&mid)]);
        assert!(matches!(
            builder.build(&parsed(&leaf), &[], None),
            Err(PathError::IssuerNotPermitted { .. })
        ));

        let signer = issue("Cert Signer", true, &ca, |p| {
            p.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        });
        let leaf = issue("Other Leaf", false, &signer, |_| {});
        let builder = PathBuilder::new(vec![parsed(&ca)], vec![parsed(&signer)]);
        assert_eq!(builder.build(&parsed(&leaf), &[], None).unwrap().len(), 3);
    }

    #[test]
    fn test_anchor_without_key_cert_sign_is_rejected() {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "Odd Root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        let key = KeyPair::generate().unwrap();
        let ca = Issued { cert: params.self_signed(&key).unwrap(), key };
        let leaf = issue("Leaf", false, &ca, |_| {});
        let builder = PathBuilder::new(vec![parsed(&ca)], Vec::new());
        assert!(builder.build(&parsed(&leaf), &[], None).is_err());
    }

    #[test]
    fn test_name_constraints_fail_closed() {
        let ca = root("Root");
        let mid = issue("Constrained", true, &ca, |p| {
            p.name_constraints = Some(NameConstraints {
                permitted_subtrees: vec![GeneralSubtree::DnsName("example.org".to_string())],
                excluded_subtrees: Vec::new(),
            });
        });
        let leaf = issue("Leaf", false, &mid, |_| {});
        let builder = PathBuilder::new(vec![parsed(&ca)], vec![parsed(&mid)]);
        assert!(matches!(
            builder.build(&parsed(&leaf), &[], None),
            Err(PathError::UnsupportedCriticalExtension { ref oid, .. }) if oid == "2.5.29.30"
        ));
    }
}
