//! Trust material: certificate records, trusted publishers and host pins.
//!
//! Full X.509 parsing is out of scope. A [`CertificateRecord`] carries the
//! fields the engine reasons about, plus the signer's Ed25519 public key so a
//! declared fingerprint can be checked against the key it claims to describe.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// One certificate in a signer's chain, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Subject common name. Display only, never used for trust decisions.
    pub subject: String,
    /// Subject name of the issuing certificate
    pub issuer: String,
    /// Lowercase hex SHA-256 of `public_key`
    pub fingerprint: String,
    pub serial_number: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    /// Hex encoded Ed25519 public key
    pub public_key: String,
}

impl CertificateRecord {
    /// A root certificate issues itself.
    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && now <= self.valid_to
    }

    /// Decode `public_key` into raw bytes.
    pub fn public_key_bytes(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.public_key).ok()?;
        bytes.try_into().ok()
    }

    /// True when `fingerprint` really is the SHA-256 of `public_key`.
    pub fn fingerprint_matches_key(&self) -> bool {
        match self.public_key_bytes() {
            Some(key) => fingerprint_eq(&self.fingerprint, &fingerprint_of(&key)),
            None => false,
        }
    }

    /// Identity triple used for publisher trust.
    pub fn identity(&self) -> PublisherIdentity {
        PublisherIdentity {
            common_name: self.subject.clone(),
            fingerprint: self.fingerprint.to_ascii_lowercase(),
            issuer: self.issuer.clone(),
            serial_number: self.serial_number.clone(),
        }
    }
}

/// Identity of a verified artifact signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherIdentity {
    pub common_name: String,
    pub fingerprint: String,
    pub issuer: String,
    pub serial_number: String,
}

/// Configured trusted publisher. All three fields must match; the common name
/// is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedPublisher {
    pub fingerprint: String,
    pub issuer: String,
    pub serial_number: String,
}

impl TrustedPublisher {
    pub fn matches(&self, identity: &PublisherIdentity) -> bool {
        fingerprint_eq(&self.fingerprint, &identity.fingerprint)
            && self.issuer == identity.issuer
            && self.serial_number == identity.serial_number
    }
}

/// Host-scoped certificate pins.
///
/// A host without an entry is unpinned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinStore {
    pins: BTreeMap<String, Vec<String>>,
}

impl PinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(pins: BTreeMap<String, Vec<String>>) -> Self {
        let pins = pins
            .into_iter()
            .map(|(host, fps)| {
                (
                    host.to_ascii_lowercase(),
                    fps.into_iter().map(|f| normalize_fingerprint(&f)).collect(),
                )
            })
            .collect();
        Self { pins }
    }

    /// Pin `fingerprint` for `host`. A host may carry several pins for rotation.
    pub fn pin(&mut self, host: &str, fingerprint: &str) {
        self.pins
            .entry(host.to_ascii_lowercase())
            .or_default()
            .push(normalize_fingerprint(fingerprint));
    }

    /// Pins for `host`, or `None` if the host is unpinned.
    pub fn pins_for(&self, host: &str) -> Option<&[String]> {
        self.pins
            .get(&host.to_ascii_lowercase())
            .map(|v| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn fingerprint_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fingerprints are compared case-insensitively, ignoring `:` separators.
pub fn normalize_fingerprint(fp: &str) -> String {
    fp.chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Constant-time fingerprint comparison.
pub fn fingerprint_eq(a: &str, b: &str) -> bool {
    let a = normalize_fingerprint(a);
    let b = normalize_fingerprint(b);
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).unwrap_u8() == 1
}
