//! Update manifest model and signed-envelope verification.
//!
//! The feed serves a [`SignedManifest`]: the JSON text of an
//! [`UpdateManifest`] plus Ed25519 signatures from pinned release keys and a
//! signing timestamp. The envelope is checked before the inner manifest is
//! parsed, so nothing from an unauthenticated manifest reaches the policy or
//! rollout logic.
//!
//! # Security
//!
//! - Ed25519 signature verification against pinned public keys
//! - Multi-signature support with configurable threshold
//! - Timestamp validation to prevent replay of stale manifests

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::error::{IntegrityError, ManifestError, UpdateError};
use crate::trust::CertificateRecord;

/// Maximum future timestamp tolerance (1 hour of clock skew).
const MAX_FUTURE_TOLERANCE_SECS: i64 = 60 * 60;

/// The update manifest describing one release.
///
/// Immutable once fetched; owned by the controller for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    pub version: Version,
    pub release_date: DateTime<Utc>,
    /// Artifact location, absolute or relative to the feed URL
    pub artifact_path: String,
    /// Artifact size in bytes
    pub size: u64,
    /// SHA-512 of the artifact, 128 lowercase hex characters
    pub content_hash: String,
    pub signature: ArtifactSignature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory: Option<bool>,
    /// Percentage of installations admitted, 0..=100. Absent means everyone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_percentage: Option<u8>,
    #[serde(default)]
    pub release_notes: String,
    /// Differential patches to this release, one per source version
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deltas: Vec<DeltaEntry>,
}

impl UpdateManifest {
    pub fn is_mandatory(&self) -> bool {
        self.mandatory.unwrap_or(false)
    }

    /// Staging percentage, treating an absent value as a full rollout.
    pub fn effective_staging(&self) -> u8 {
        self.staging_percentage.unwrap_or(100)
    }

    /// Delta advertised for upgrades from `current`, if any.
    pub fn delta_from(&self, current: &Version) -> Option<&DeltaEntry> {
        self.deltas.iter().find(|d| &d.from_version == current)
    }

    /// Expected content hash as bytes, if it is valid hex of the right length.
    pub fn content_hash_bytes(&self) -> Option<[u8; 64]> {
        let bytes = hex::decode(&self.content_hash).ok()?;
        bytes.try_into().ok()
    }

    /// Cheap immutable summary handed to event consumers.
    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            version: self.version.clone(),
            release_date: self.release_date,
            size: self.size,
            mandatory: self.is_mandatory(),
            release_notes: self.release_notes.clone(),
        }
    }
}

/// A differential patch advertised by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEntry {
    pub from_version: Version,
    pub path: String,
    pub size: u64,
    /// SHA-512 of the delta bytes
    pub content_hash: String,
}

/// Artifact signature block: signature over the full artifact bytes and the
/// signer's certificate chain, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSignature {
    /// Hex encoded Ed25519 signature
    pub value: String,
    pub certificate_chain: Vec<CertificateRecord>,
}

impl ArtifactSignature {
    /// The signing certificate.
    pub fn leaf(&self) -> Option<&CertificateRecord> {
        self.certificate_chain.first()
    }

    /// Decode `value` into an Ed25519 signature.
    pub fn signature(&self) -> Result<Signature, IntegrityError> {
        let bytes = hex::decode(&self.value)
            .map_err(|e| IntegrityError::SignatureInvalid(format!("bad signature encoding: {}", e)))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| IntegrityError::SignatureInvalid("signature must be 64 bytes".into()))?;
        Ok(Signature::from_bytes(&bytes))
    }
}

/// Snapshot of a manifest for UI events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSummary {
    pub version: Version,
    pub release_date: DateTime<Utc>,
    pub size: u64,
    pub mandatory: bool,
    pub release_notes: String,
}

/// A signed update manifest with signatures and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedManifest {
    /// JSON string of UpdateManifest
    pub manifest: String,
    /// Signatures from release signing keys
    pub signatures: Vec<ManifestSignature>,
    /// Unix timestamp when the manifest was signed
    pub timestamp: i64,
}

impl SignedManifest {
    pub fn new(manifest: String, signatures: Vec<ManifestSignature>, timestamp: i64) -> Self {
        Self {
            manifest,
            signatures,
            timestamp,
        }
    }
}

/// A signature on the manifest envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSignature {
    /// Identifier for the signing key
    pub key_id: String,
    /// Hex encoded Ed25519 signature over the manifest JSON
    pub signature: String,
}

impl ManifestSignature {
    pub fn new(key_id: String, signature: &Signature) -> Self {
        Self {
            key_id,
            signature: hex::encode(signature.to_bytes()),
        }
    }

    fn decode(&self) -> Option<Signature> {
        let bytes = hex::decode(&self.signature).ok()?;
        let bytes: [u8; 64] = bytes.try_into().ok()?;
        Some(Signature::from_bytes(&bytes))
    }
}

/// Verifies manifest envelopes against pinned release keys.
///
/// # Example
///
/// ```ignore
/// let verifier = ManifestVerifier::new(keys, 1, max_age, clock)?;
/// let manifest = verifier.verify_and_parse(&feed_bytes)?;
/// ```
pub struct ManifestVerifier {
    /// Pinned public keys. Several keys allow rotation.
    trusted_keys: Vec<VerifyingKey>,
    /// Minimum number of distinct keys that must have signed.
    threshold: usize,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl ManifestVerifier {
    /// Create a verifier. A zero threshold would accept unsigned manifests
    /// and is rejected.
    pub fn new(
        trusted_keys: Vec<VerifyingKey>,
        threshold: usize,
        max_age: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, UpdateError> {
        if threshold == 0 {
            return Err(UpdateError::Config(
                "signature threshold must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            trusted_keys,
            threshold,
            max_age,
            clock,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn trusted_keys(&self) -> &[VerifyingKey] {
        &self.trusted_keys
    }

    /// Verify the envelope and parse the inner manifest.
    ///
    /// 1. Parse the envelope JSON
    /// 2. Check the timestamp window
    /// 3. Count valid signatures from distinct pinned keys
    /// 4. Parse the inner manifest
    pub fn verify_and_parse(&self, data: &[u8]) -> Result<UpdateManifest, UpdateError> {
        let envelope: SignedManifest =
            serde_json::from_slice(data).map_err(ManifestError::from)?;

        self.verify_timestamp(envelope.timestamp)?;

        let valid = self.count_valid_signatures(&envelope);
        if valid < self.threshold {
            error!(
                required = self.threshold,
                found = valid,
                "Insufficient valid signatures on manifest"
            );
            return Err(IntegrityError::InsufficientSignatures {
                required: self.threshold,
                found: valid,
            }
            .into());
        }
        debug!(valid, threshold = self.threshold, "Manifest envelope verified");

        let manifest: UpdateManifest =
            serde_json::from_str(&envelope.manifest).map_err(ManifestError::from)?;

        info!(
            version = %manifest.version,
            size = manifest.size,
            deltas = manifest.deltas.len(),
            "Manifest accepted"
        );
        Ok(manifest)
    }

    fn verify_timestamp(&self, timestamp: i64) -> Result<(), ManifestError> {
        let now = self.clock.now().timestamp();

        if timestamp < now - self.max_age.num_seconds() {
            error!(
                manifest_timestamp = timestamp,
                current_time = now,
                "Manifest timestamp is too old"
            );
            return Err(ManifestError::TooOld);
        }

        if timestamp > now + MAX_FUTURE_TOLERANCE_SECS {
            error!(
                manifest_timestamp = timestamp,
                current_time = now,
                "Manifest timestamp is in the future"
            );
            return Err(ManifestError::FromFuture);
        }

        Ok(())
    }

    /// Each trusted key validates at most one signature.
    fn count_valid_signatures(&self, envelope: &SignedManifest) -> usize {
        let bytes = envelope.manifest.as_bytes();
        let mut used = vec![false; self.trusted_keys.len()];
        let mut valid = 0;

        for sig in &envelope.signatures {
            let Some(signature) = sig.decode() else {
                debug!(key_id = %sig.key_id, "Undecodable manifest signature");
                continue;
            };
            for (i, key) in self.trusted_keys.iter().enumerate() {
                if used[i] {
                    continue;
                }
                if key.verify(bytes, &signature).is_ok() {
                    used[i] = true;
                    valid += 1;
                    debug!(key_id = %sig.key_id, "Valid manifest signature");
                    break;
                }
            }
        }

        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::testing::ReleaseFixture;
    use ed25519_dalek::{Signer, SigningKey};

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(ReleaseFixture::reference_time()))
    }

    fn envelope(json: &str, keys: &[&SigningKey], timestamp: i64) -> Vec<u8> {
        let signatures = keys
            .iter()
            .enumerate()
            .map(|(i, k)| ManifestSignature::new(format!("key{}", i), &k.sign(json.as_bytes())))
            .collect();
        serde_json::to_vec(&SignedManifest::new(json.to_string(), signatures, timestamp)).unwrap()
    }

    fn manifest_json() -> String {
        let fixture = ReleaseFixture::new("1.2.3", 1_200_000);
        serde_json::to_string(&fixture.manifest).unwrap()
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let result = ManifestVerifier::new(vec![], 0, Duration::days(7), clock());
        assert!(matches!(result, Err(UpdateError::Config(_))));
    }

    #[test]
    fn test_verify_valid_manifest() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let clock = clock();
        let data = envelope(&manifest_json(), &[&key], clock.now().timestamp());

        let verifier =
            ManifestVerifier::new(vec![key.verifying_key()], 1, Duration::days(7), clock).unwrap();
        let manifest = verifier.verify_and_parse(&data).unwrap();
        assert_eq!(manifest.version, Version::new(1, 2, 3));
    }

    #[test]
    fn test_verify_wrong_key() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let other = SigningKey::from_bytes(&[2u8; 32]);
        let clock = clock();
        let data = envelope(&manifest_json(), &[&key], clock.now().timestamp());

        let verifier =
            ManifestVerifier::new(vec![other.verifying_key()], 1, Duration::days(7), clock)
                .unwrap();
        let result = verifier.verify_and_parse(&data);
        assert!(matches!(
            result,
            Err(UpdateError::Integrity(IntegrityError::InsufficientSignatures {
                required: 1,
                found: 0
            }))
        ));
    }

    #[test]
    fn test_same_key_counts_once() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let other = SigningKey::from_bytes(&[2u8; 32]);
        let clock = clock();
        let data = envelope(&manifest_json(), &[&key, &key], clock.now().timestamp());

        let verifier = ManifestVerifier::new(
            vec![key.verifying_key(), other.verifying_key()],
            2,
            Duration::days(7),
            clock,
        )
        .unwrap();
        assert!(matches!(
            verifier.verify_and_parse(&data),
            Err(UpdateError::Integrity(IntegrityError::InsufficientSignatures {
                required: 2,
                found: 1
            }))
        ));
    }

    #[test]
    fn test_manifest_too_old_and_from_future() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let clock = clock();
        let now = clock.now().timestamp();
        let verifier =
            ManifestVerifier::new(vec![key.verifying_key()], 1, Duration::days(7), clock).unwrap();

        let old = envelope(&manifest_json(), &[&key], now - 8 * 24 * 3600);
        assert!(matches!(
            verifier.verify_and_parse(&old),
            Err(UpdateError::Manifest(ManifestError::TooOld))
        ));

        let future = envelope(&manifest_json(), &[&key], now + 2 * 3600);
        assert!(matches!(
            verifier.verify_and_parse(&future),
            Err(UpdateError::Manifest(ManifestError::FromFuture))
        ));
    }

    #[test]
    fn test_malformed_envelope() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let verifier =
            ManifestVerifier::new(vec![key.verifying_key()], 1, Duration::days(7), clock())
                .unwrap();
        assert!(matches!(
            verifier.verify_and_parse(b"not json"),
            Err(UpdateError::Manifest(ManifestError::Malformed(_)))
        ));
    }

    #[test]
    fn test_manifest_accessors() {
        let mut manifest = ReleaseFixture::new("2.0.1", 1_200_000).manifest;
        assert!(!manifest.is_mandatory());
        assert_eq!(manifest.effective_staging(), 100);
        assert!(manifest.content_hash_bytes().is_some());

        manifest.staging_percentage = Some(20);
        manifest.mandatory = Some(true);
        assert!(manifest.is_mandatory());
        assert_eq!(manifest.effective_staging(), 20);

        manifest.deltas.push(DeltaEntry {
            from_version: Version::new(2, 0, 0),
            path: "app-2.0.0-2.0.1.delta".into(),
            size: 10,
            content_hash: "00".repeat(64),
        });
        assert!(manifest.delta_from(&Version::new(2, 0, 0)).is_some());
        assert!(manifest.delta_from(&Version::new(1, 9, 0)).is_none());
    }

    #[test]
    fn test_manifest_camel_case_fields() {
        let manifest = ReleaseFixture::new("2.0.1", 1_200_000).manifest;
        let json = serde_json::to_value(&manifest).unwrap();
        assert!(json.get("artifactPath").is_some());
        assert!(json.get("contentHash").is_some());
        assert!(json.get("releaseDate").is_some());
    }
}
