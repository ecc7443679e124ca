//! Parsed X.509 certificates and CRLs.
//!
//! [`Certificate`] and [`Crl`] parse their DER once with `x509-parser` and
//! keep owned copies of every field the validation core looks at. Both are
//! cheap to clone. Signature checks re-parse the DER on demand.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;
use x509_parser::time::ASN1Time;

use crate::error::{CertError, CertResult as Result};

/// SHA-256 of the DER encoding; identifies a certificate by content.
pub type CertKey = [u8; 32];

const OID_AIA_OCSP: &str = "1.3.6.1.5.5.7.48.1";
const OID_OCSP_NOCHECK: &str = "1.3.6.1.5.5.7.48.1.5";

const PEM_CERT_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_CERT_END: &str = "-----END CERTIFICATE-----";
const PEM_CRL_BEGIN: &str = "-----BEGIN X509 CRL-----";
const PEM_CRL_END: &str = "-----END X509 CRL-----";

/// An X.509 certificate.
#[derive(Clone)]
pub struct Certificate {
    inner: Arc<CertData>,
}

struct CertData {
    der: Vec<u8>,
    fingerprint: CertKey,
    subject_dn: String,
    issuer_dn: String,
    subject_raw: Vec<u8>,
    issuer_raw: Vec<u8>,
    serial: Vec<u8>,
    ski: String,
    aki_key_id: Option<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    is_ca: bool,
    path_len: Option<u32>,
    key_cert_sign: bool,
    crl_sign: bool,
    ocsp_signing: bool,
    ocsp_nocheck: bool,
    critical_oids: Vec<String>,
    crl_urls: Vec<String>,
    ocsp_urls: Vec<String>,
}

impl Certificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        let data = {
            let (_, x509) = X509Certificate::from_der(&der)
                .map_err(|e| CertError::Parse(e.to_string()))?;
            extract(&x509, &der)?
        };
        Ok(Self {
            inner: Arc::new(CertData { der, ..data }),
        })
    }

    /// Every `CERTIFICATE` block in a PEM document.
    pub fn from_pem(text: &str) -> Result<Vec<Self>> {
        pem_blocks(text, PEM_CERT_BEGIN, PEM_CERT_END)?
            .into_iter()
            .map(Self::from_der)
            .collect()
    }

    /// PEM if the input looks like text, DER otherwise.
    pub fn from_pem_or_der(bytes: &[u8]) -> Result<Vec<Self>> {
        match std::str::from_utf8(bytes) {
            Ok(text) if text.contains(PEM_CERT_BEGIN) => Self::from_pem(text),
            _ => Ok(vec![Self::from_der(bytes)?]),
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.inner.der
    }

    pub fn to_pem(&self) -> String {
        to_pem(&self.inner.der, PEM_CERT_BEGIN, PEM_CERT_END)
    }

    pub fn fingerprint(&self) -> &CertKey {
        &self.inner.fingerprint
    }

    pub fn fingerprint_hex(&self) -> String {
        hex(&self.inner.fingerprint)
    }

    pub fn subject_dn(&self) -> &str {
        &self.inner.subject_dn
    }

    pub fn issuer_dn(&self) -> &str {
        &self.inner.issuer_dn
    }

    /// DER of the subject name, for exact comparisons.
    pub fn subject_raw(&self) -> &[u8] {
        &self.inner.subject_raw
    }

    pub fn issuer_raw(&self) -> &[u8] {
        &self.inner.issuer_raw
    }

    /// Serial number without leading zero bytes.
    pub fn serial(&self) -> &[u8] {
        &self.inner.serial
    }

    pub fn serial_hex(&self) -> String {
        hex(&self.inner.serial)
    }

    /// Base64 subject key identifier: the extension value, or the SHA-1 of
    /// the public key bits when the extension is absent.
    pub fn ski(&self) -> &str {
        &self.inner.ski
    }

    /// Base64 key identifier from the authority key identifier extension.
    pub fn aki_key_id(&self) -> Option<&str> {
        self.inner.aki_key_id.as_deref()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.inner.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.inner.not_after
    }

    pub fn check_validity(&self, at: DateTime<Utc>) -> Result<()> {
        if at > self.inner.not_after {
            return Err(CertError::Expired {
                subject: self.inner.subject_dn.clone(),
                not_after: self.inner.not_after.to_rfc3339(),
            });
        }
        if at < self.inner.not_before {
            return Err(CertError::NotYetValid {
                subject: self.inner.subject_dn.clone(),
                not_before: self.inner.not_before.to_rfc3339(),
            });
        }
        Ok(())
    }

    pub fn is_ca(&self) -> bool {
        self.inner.is_ca
    }

    /// basicConstraints pathLenConstraint, if any.
    pub fn path_len_constraint(&self) -> Option<u32> {
        self.inner.path_len
    }

    /// True unless a key usage extension is present without keyCertSign.
    pub fn allows_key_cert_sign(&self) -> bool {
        self.inner.key_cert_sign
    }

    /// True unless a key usage extension is present without cRLSign.
    pub fn allows_crl_sign(&self) -> bool {
        self.inner.crl_sign
    }

    pub fn has_ocsp_signing_eku(&self) -> bool {
        self.inner.ocsp_signing
    }

    /// id-pkix-ocsp-nocheck: the responder certificate needs no revocation check.
    pub fn has_ocsp_nocheck(&self) -> bool {
        self.inner.ocsp_nocheck
    }

    pub fn critical_extension_oids(&self) -> &[String] {
        &self.inner.critical_oids
    }

    pub fn crl_distribution_urls(&self) -> &[String] {
        &self.inner.crl_urls
    }

    pub fn ocsp_responder_urls(&self) -> &[String] {
        &self.inner.ocsp_urls
    }

    pub fn is_self_issued(&self) -> bool {
        self.inner.subject_raw == self.inner.issuer_raw
    }

    /// Verify this certificate's signature with `issuer`'s public key.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> Result<()> {
        let (_, child) = X509Certificate::from_der(self.der())
            .map_err(|e| CertError::Parse(e.to_string()))?;
        let (_, parent) = X509Certificate::from_der(issuer.der())
            .map_err(|e| CertError::Parse(e.to_string()))?;
        child
            .verify_signature(Some(parent.public_key()))
            .map_err(|e| CertError::Signature(format!("{} by {}: {e}", self.subject_dn(), issuer.subject_dn())))
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.inner.fingerprint == other.inner.fingerprint
    }
}

impl Eq for Certificate {}

impl std::hash::Hash for Certificate {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.fingerprint.hash(state);
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.inner.subject_dn)
            .field("serial", &self.serial_hex())
            .finish()
    }
}

fn extract(x509: &X509Certificate<'_>, der: &[u8]) -> Result<CertData> {
    let mut ski = None;
    let mut aki_key_id = None;
    let mut is_ca = false;
    let mut path_len = None;
    let mut key_cert_sign = true;
    let mut crl_sign = true;
    let mut ocsp_signing = false;
    let mut ocsp_nocheck = false;
    let mut critical_oids = Vec::new();
    let mut crl_urls = Vec::new();
    let mut ocsp_urls = Vec::new();

    for ext in x509.extensions() {
        let oid = ext.oid.to_id_string();
        if ext.critical {
            critical_oids.push(oid.clone());
        }
        if oid == OID_OCSP_NOCHECK {
            ocsp_nocheck = true;
        }
        match ext.parsed_extension() {
            ParsedExtension::SubjectKeyIdentifier(kid) => ski = Some(STANDARD.encode(kid.0)),
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                aki_key_id = aki.key_identifier.as_ref().map(|kid| STANDARD.encode(kid.0));
            }
            ParsedExtension::BasicConstraints(bc) => {
                is_ca = bc.ca;
                path_len = bc.path_len_constraint;
            }
            ParsedExtension::KeyUsage(ku) => {
                key_cert_sign = ku.key_cert_sign();
                crl_sign = ku.crl_sign();
            }
            ParsedExtension::ExtendedKeyUsage(eku) => ocsp_signing = eku.ocsp_signing,
            ParsedExtension::CRLDistributionPoints(cdp) => {
                for point in cdp.points.iter() {
                    if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                        crl_urls.extend(uris(names));
                    }
                }
            }
            ParsedExtension::AuthorityInfoAccess(aia) => {
                for desc in &aia.accessdescs {
                    if desc.access_method.to_id_string() == OID_AIA_OCSP {
                        if let GeneralName::URI(uri) = &desc.access_location {
                            ocsp_urls.push(uri.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let ski = ski.unwrap_or_else(|| {
        let bits: &[u8] = &x509.public_key().subject_public_key.data;
        STANDARD.encode(Sha1::digest(bits))
    });
    let validity = x509.validity();

    Ok(CertData {
        der: Vec::new(),
        fingerprint: Sha256::digest(der).into(),
        subject_dn: x509.subject().to_string(),
        issuer_dn: x509.issuer().to_string(),
        subject_raw: x509.subject().as_raw().to_vec(),
        issuer_raw: x509.issuer().as_raw().to_vec(),
        serial: trim_serial(x509.raw_serial()).to_vec(),
        ski,
        aki_key_id,
        not_before: to_utc(&validity.not_before)?,
        not_after: to_utc(&validity.not_after)?,
        is_ca,
        path_len,
        key_cert_sign,
        crl_sign,
        ocsp_signing,
        ocsp_nocheck,
        critical_oids,
        crl_urls,
        ocsp_urls,
    })
}

fn uris(names: &[GeneralName<'_>]) -> Vec<String> {
    names
        .iter()
        .filter_map(|name| match name {
            GeneralName::URI(uri) => Some(uri.to_string()),
            _ => None,
        })
        .collect()
}

fn to_utc(time: &ASN1Time) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| CertError::Parse(format!("time out of range: {time}")))
}

/// Serial numbers compare without their sign padding.
pub fn trim_serial(raw: &[u8]) -> &[u8] {
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len().saturating_sub(1));
    &raw[start..]
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ── CRLs ────────────────────────────────────────────────────────

/// Authority key identifier of a CRL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityKeyId {
    /// Base64 key identifier.
    pub key_id: Option<String>,
    pub issuer_dn: Option<String>,
    pub serial: Option<Vec<u8>>,
}

/// A certificate revocation list.
#[derive(Clone)]
pub struct Crl {
    inner: Arc<CrlData>,
}

struct CrlData {
    der: Vec<u8>,
    issuer_dn: String,
    issuer_raw: Vec<u8>,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    revoked: HashSet<Vec<u8>>,
    authority_key_id: Option<AuthorityKeyId>,
}

impl Crl {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        let (_, crl) = CertificateRevocationList::from_der(&der)
            .map_err(|e| CertError::Parse(e.to_string()))?;

        let mut authority_key_id = None;
        for ext in crl.extensions() {
            if let ParsedExtension::AuthorityKeyIdentifier(aki) = ext.parsed_extension() {
                let issuer_dn = aki.authority_cert_issuer.as_ref().and_then(|names| {
                    names.iter().find_map(|name| match name {
                        GeneralName::DirectoryName(dn) => Some(dn.to_string()),
                        _ => None,
                    })
                });
                authority_key_id = Some(AuthorityKeyId {
                    key_id: aki.key_identifier.as_ref().map(|kid| STANDARD.encode(kid.0)),
                    issuer_dn,
                    serial: aki.authority_cert_serial.map(|s| trim_serial(s).to_vec()),
                });
            }
        }

        let data = CrlData {
            issuer_dn: crl.issuer().to_string(),
            issuer_raw: crl.issuer().as_raw().to_vec(),
            this_update: to_utc(&crl.last_update())?,
            next_update: crl.next_update().map(|t| to_utc(&t)).transpose()?,
            revoked: crl
                .iter_revoked_certificates()
                .map(|r| trim_serial(r.raw_serial()).to_vec())
                .collect(),
            authority_key_id,
            der: Vec::new(),
        };
        drop(crl);
        Ok(Self {
            inner: Arc::new(CrlData { der, ..data }),
        })
    }

    /// DER, or the first `X509 CRL` block of a PEM document.
    pub fn from_pem_or_der(bytes: &[u8]) -> Result<Self> {
        match std::str::from_utf8(bytes) {
            Ok(text) if text.contains(PEM_CRL_BEGIN) => {
                let der = pem_blocks(text, PEM_CRL_BEGIN, PEM_CRL_END)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| CertError::Parse("empty PEM CRL".to_string()))?;
                Self::from_der(der)
            }
            _ => Self::from_der(bytes),
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.inner.der
    }

    pub fn issuer_dn(&self) -> &str {
        &self.inner.issuer_dn
    }

    pub fn issuer_raw(&self) -> &[u8] {
        &self.inner.issuer_raw
    }

    pub fn this_update(&self) -> DateTime<Utc> {
        self.inner.this_update
    }

    pub fn next_update(&self) -> Option<DateTime<Utc>> {
        self.inner.next_update
    }

    pub fn authority_key_id(&self) -> Option<&AuthorityKeyId> {
        self.inner.authority_key_id.as_ref()
    }

    pub fn revoked_count(&self) -> usize {
        self.inner.revoked.len()
    }

    pub fn is_revoked(&self, cert: &Certificate) -> bool {
        self.inner.revoked.contains(cert.serial())
    }

    pub fn verify_signature(&self, signer: &Certificate) -> Result<()> {
        let (_, crl) = CertificateRevocationList::from_der(self.der())
            .map_err(|e| CertError::Parse(e.to_string()))?;
        let (_, signer_x509) = X509Certificate::from_der(signer.der())
            .map_err(|e| CertError::Parse(e.to_string()))?;
        crl.verify_signature(signer_x509.public_key())
            .map_err(|e| CertError::Signature(format!("CRL of {}: {e}", self.issuer_dn())))
    }
}

impl fmt::Debug for Crl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crl")
            .field("issuer", &self.inner.issuer_dn)
            .field("revoked", &self.inner.revoked.len())
            .field("next_update", &self.inner.next_update)
            .finish()
    }
}

// ── PEM ─────────────────────────────────────────────────────────

fn pem_blocks(text: &str, begin: &str, end: &str) -> Result<Vec<Vec<u8>>> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(begin) {
        let body = &rest[start + begin.len()..];
        let stop = body
            .find(end)
            .ok_or_else(|| CertError::Parse(format!("unterminated PEM block, missing {end}")))?;
        let b64: String = body[..stop].chars().filter(|c| !c.is_whitespace()).collect();
        blocks.push(
            STANDARD
                .decode(b64)
                .map_err(|e| CertError::Parse(format!("invalid PEM base64: {e}")))?,
        );
        rest = &body[stop + end.len()..];
    }
    if blocks.is_empty() {
        return Err(CertError::Parse(format!("no {begin} block found")));
    }
    Ok(blocks)
}

fn to_pem(der: &[u8], begin: &str, end: &str) -> String {
    let b64 = STANDARD.encode(der);
    let mut out = String::with_capacity(b64.len() + b64.len() / 64 + begin.len() + end.len() + 4);
    out.push_str(begin);
    out.push('\n');
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(end);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    fn ca() -> (rcgen::Certificate, KeyPair) {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "Test Root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let key = KeyPair::generate().unwrap();
        (params.self_signed(&key).unwrap(), key)
    }

    #[test]
    fn test_parse_ca_certificate() {
        let (root, _) = ca();
        let cert = Certificate::from_der(root.der().to_vec()).unwrap();
        assert!(cert.is_ca());
        assert!(cert.is_self_issued());
        assert!(cert.subject_dn().contains("Test Root"));
        assert!(!cert.ski().is_empty());
        assert!(cert.verify_signed_by(&cert).is_ok());
        assert!(cert.check_validity(Utc::now()).is_ok());
    }

    #[test]
    fn test_issuer_constraints_extracted() {
        let (root, _) = ca();
        let cert = Certificate::from_der(root.der().to_vec()).unwrap();
        assert_eq!(cert.path_len_constraint(), None);
        assert!(cert.allows_key_cert_sign());

        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "Signing Only");
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(2));
        params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];
        let key = KeyPair::generate().unwrap();
        let cert = Certificate::from_der(params.self_signed(&key).unwrap().der().to_vec()).unwrap();
        assert_eq!(cert.path_len_constraint(), Some(2));
        assert!(!cert.allows_key_cert_sign());
        assert!(!cert.allows_crl_sign());
    }

    #[test]
    fn test_pem_round_trip() {
        let (root, _) = ca();
        let cert = Certificate::from_der(root.der().to_vec()).unwrap();
        let parsed = Certificate::from_pem(&cert.to_pem()).unwrap();
        assert_eq!(parsed, vec![cert.clone()]);
        assert_eq!(Certificate::from_pem_or_der(cert.der()).unwrap()[0], cert);
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(matches!(
            Certificate::from_der(vec![1, 2, 3]),
            Err(CertError::Parse(_))
        ));
        assert!(Certificate::from_pem("nothing here").is_err());
    }

    #[test]
    fn test_trim_serial() {
        assert_eq!(trim_serial(&[0, 0, 0x81]), &[0x81]);
        assert_eq!(trim_serial(&[0]), &[0]);
        assert_eq!(hex(&[0x0a, 0xff]), "0aff");
    }
}
