//! Capability certificates and the trusted issuer set.
//!
//! This is verification only: a certificate binds an agent id to a list of
//! capabilities under an issuer's Ed25519 signature, and the responder checks
//! it against the issuers it was configured to trust. There is no chain
//! building and no revocation list.

use crate::clock;
use a2a_crypto::{signatures, AgentSecretKey};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityCertificate {
    pub serial: Uuid,
    pub issuer: String,
    pub subject: String,
    pub capabilities: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub signature: Vec<u8>,
}

pub(crate) fn put_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_be_bytes());
    out.extend_from_slice(field);
}

impl CapabilityCertificate {
    /// Canonical bytes covered by the issuer signature
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        put_field(&mut out, b"a2a-keyx/capability-certificate/v1");
        put_field(&mut out, self.serial.as_bytes());
        put_field(&mut out, self.issuer.as_bytes());
        put_field(&mut out, self.subject.as_bytes());
        out.extend_from_slice(&(self.capabilities.len() as u32).to_be_bytes());
        for capability in &self.capabilities {
            put_field(&mut out, capability.as_bytes());
        }
        out.extend_from_slice(&self.not_before.timestamp().to_be_bytes());
        out.extend_from_slice(&self.not_after.timestamp().to_be_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustViolation {
    #[error("issuer {0} is not trusted")]
    UnknownIssuer(String),

    #[error("certificate signature does not verify")]
    BadSignature,

    #[error("certificate subject {certified} does not match {presented}")]
    SubjectMismatch { certified: String, presented: String },

    #[error("certificate is not valid until {0}")]
    NotYetValid(DateTime<Utc>),

    #[error("certificate expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("capability {0} is not certified")]
    CapabilityNotCertified(String),

    #[error("a certificate is required")]
    Missing,
}

/// Issuer name -> Ed25519 verifying key
#[derive(Default)]
pub struct TrustedCaSet {
    issuers: RwLock<HashMap<String, [u8; 32]>>,
}

impl TrustedCaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_issuers(issuers: HashMap<String, [u8; 32]>) -> Self {
        Self { issuers: RwLock::new(issuers) }
    }

    pub fn add_issuer(&self, name: impl Into<String>, verifying_key: [u8; 32]) {
        self.issuers.write().insert(name.into(), verifying_key);
    }

    pub fn remove_issuer(&self, name: &str) -> bool {
        self.issuers.write().remove(name).is_some()
    }

    /// Swap the whole set at once
    pub fn replace(&self, issuers: HashMap<String, [u8; 32]>) {
        *self.issuers.write() = issuers;
    }

    pub fn len(&self) -> usize {
        self.issuers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.issuers.read().is_empty()
    }

    /// Check `certificate` for an agent presenting `subject` and claiming `claimed`.
    pub fn verify(
        &self,
        certificate: &CapabilityCertificate,
        subject: &str,
        claimed: &[String],
        now: DateTime<Utc>,
    ) -> std::result::Result<(), TrustViolation> {
        let verifying_key = self
            .issuers
            .read()
            .get(&certificate.issuer)
            .copied()
            .ok_or_else(|| TrustViolation::UnknownIssuer(certificate.issuer.clone()))?;

        signatures::verify(&verifying_key, &certificate.signing_payload(), &certificate.signature)
            .map_err(|_| TrustViolation::BadSignature)?;

        if certificate.subject != subject {
            return Err(TrustViolation::SubjectMismatch {
                certified: certificate.subject.clone(),
                presented: subject.to_string(),
            });
        }
        if now < certificate.not_before {
            return Err(TrustViolation::NotYetValid(certificate.not_before));
        }
        if now >= certificate.not_after {
            return Err(TrustViolation::Expired(certificate.not_after));
        }
        if let Some(missing) = claimed.iter().find(|c| !certificate.capabilities.contains(c)) {
            return Err(TrustViolation::CapabilityNotCertified(missing.clone()));
        }
        Ok(())
    }
}

/// Minimal certificate issuer for tests, demos and bootstrap tooling
pub struct CertificateAuthority {
    name: String,
    key: AgentSecretKey,
}

impl CertificateAuthority {
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: AgentSecretKey::generate(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn verifying_key(&self) -> [u8; 32] {
        self.key.public_key().verifying
    }

    pub fn issue(
        &self,
        subject: &str,
        capabilities: &[&str],
        valid_for: Duration,
        now: DateTime<Utc>,
    ) -> CapabilityCertificate {
        let mut certificate = CapabilityCertificate {
            serial: Uuid::new_v4(),
            issuer: self.name.clone(),
            subject: subject.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            not_before: now,
            not_after: clock::after(now, valid_for),
            signature: Vec::new(),
        };
        certificate.signature = self.key.sign(&certificate.signing_payload()).to_vec();
        certificate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    fn setup() -> (CertificateAuthority, TrustedCaSet) {
        let ca = CertificateAuthority::generate("root-ca");
        let trusted = TrustedCaSet::new();
        trusted.add_issuer(ca.name(), ca.verifying_key());
        (ca, trusted)
    }

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_valid_certificate() {
        let (ca, trusted) = setup();
        let now = Utc::now();
        let cert = ca.issue("alice", &["messaging", "storage"], DAY, now);

        assert!(trusted.verify(&cert, "alice", &caps(&["messaging"]), now).is_ok());
        assert!(trusted.verify(&cert, "alice", &[], now).is_ok());
    }

    #[test]
    fn test_rejections() {
        let (ca, trusted) = setup();
        let now = Utc::now();
        let cert = ca.issue("alice", &["messaging"], DAY, now);

        assert!(matches!(
            trusted.verify(&cert, "mallory", &[], now),
            Err(TrustViolation::SubjectMismatch { .. })
        ));
        assert!(matches!(
            trusted.verify(&cert, "alice", &caps(&["admin"]), now),
            Err(TrustViolation::CapabilityNotCertified(c)) if c == "admin"
        ));
        assert!(matches!(
            trusted.verify(&cert, "alice", &[], now + chrono::Duration::days(2)),
            Err(TrustViolation::Expired(_))
        ));
        assert!(matches!(
            trusted.verify(&cert, "alice", &[], now - chrono::Duration::seconds(1)),
            Err(TrustViolation::NotYetValid(_))
        ));
    }

    #[test]
    fn test_tampered_capabilities() {
        let (ca, trusted) = setup();
        let now = Utc::now();
        let mut cert = ca.issue("alice", &["messaging"], DAY, now);
        cert.capabilities.push("admin".to_string());

        assert_eq!(
            trusted.verify(&cert, "alice", &caps(&["admin"]), now),
            Err(TrustViolation::BadSignature)
        );
    }

    #[test]
    fn test_unknown_and_replaced_issuers() {
        let (ca, trusted) = setup();
        let rogue = CertificateAuthority::generate("rogue-ca");
        let now = Utc::now();

        let cert = rogue.issue("alice", &[], DAY, now);
        assert!(matches!(
            trusted.verify(&cert, "alice", &[], now),
            Err(TrustViolation::UnknownIssuer(_))
        ));

        // Same name, different key
        let impostor = CertificateAuthority::generate("root-ca");
        let cert = impostor.issue("alice", &[], DAY, now);
        assert_eq!(trusted.verify(&cert, "alice", &[], now), Err(TrustViolation::BadSignature));

        trusted.replace(HashMap::from([(impostor.name().to_string(), impostor.verifying_key())]));
        assert!(trusted.verify(&cert, "alice", &[], now).is_ok());
        let original = ca.issue("alice", &[], DAY, now);
        assert_eq!(trusted.verify(&original, "alice", &[], now), Err(TrustViolation::BadSignature));
        assert_eq!(trusted.len(), 1);
    }
}
