//! Artifact and manifest integrity verification.
//!
//! # Security
//!
//! - SHA-512 content hashes compared in constant time
//! - Publisher trust is decided on fingerprint, issuer and serial number.
//!   The display name is never consulted.
//! - Certificate chains are walked leaf to root and must end at a
//!   self-signed, optionally pinned, root
//! - Host pinning fails closed once a host has a pin entry
//!
//! Every failure here is an [`IntegrityError`] and is never retried.

use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::error::IntegrityError;
use crate::manifest::{ArtifactSignature, UpdateManifest};
use crate::trust::{fingerprint_eq, CertificateRecord, PinStore, PublisherIdentity, TrustedPublisher};

/// Smallest artifact size accepted from a manifest.
pub const MIN_ARTIFACT_SIZE: u64 = 1_000_000;

/// Largest artifact size accepted from a manifest.
pub const MAX_ARTIFACT_SIZE: u64 = 500_000_000;

/// Hex length of a SHA-512 digest.
pub const CONTENT_HASH_HEX_LEN: usize = 128;

/// Longest certificate chain walked before giving up.
const MAX_CHAIN_DEPTH: usize = 8;

/// Verifies manifests, artifact signatures, certificate chains and pins.
///
/// Holds only configuration. Certificate records arrive with each manifest
/// and are not retained between calls.
pub struct IntegrityVerifier {
    trusted_publishers: Vec<TrustedPublisher>,
    /// Root fingerprints. Empty means any self-signed root is accepted.
    trusted_roots: Vec<String>,
    pins: PinStore,
    clock: Arc<dyn Clock>,
}

impl IntegrityVerifier {
    pub fn new(
        trusted_publishers: Vec<TrustedPublisher>,
        trusted_roots: Vec<String>,
        pins: PinStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            trusted_publishers,
            trusted_roots,
            pins,
            clock,
        }
    }

    pub fn pins(&self) -> &PinStore {
        &self.pins
    }

    /// Check the fields of a parsed manifest before anything acts on it.
    pub fn verify_manifest_shape(&self, manifest: &UpdateManifest) -> Result<(), IntegrityError> {
        if !manifest.version.pre.is_empty() || !manifest.version.build.is_empty() {
            return Err(IntegrityError::InvalidManifestField {
                field: "version",
                reason: format!("`{}` is not MAJOR.MINOR.PATCH", manifest.version),
            });
        }

        if manifest.artifact_path.trim().is_empty() {
            return Err(IntegrityError::InvalidManifestField {
                field: "artifactPath",
                reason: "empty".to_string(),
            });
        }

        if !is_content_hash(&manifest.content_hash) {
            return Err(IntegrityError::InvalidManifestField {
                field: "contentHash",
                reason: format!(
                    "expected {} lowercase hex characters",
                    CONTENT_HASH_HEX_LEN
                ),
            });
        }

        if !(MIN_ARTIFACT_SIZE..=MAX_ARTIFACT_SIZE).contains(&manifest.size) {
            error!(size = manifest.size, "Manifest declares suspicious artifact size");
            return Err(IntegrityError::SuspiciousSize {
                size: manifest.size,
            });
        }

        if let Some(pct) = manifest.staging_percentage {
            if pct > 100 {
                return Err(IntegrityError::InvalidManifestField {
                    field: "stagingPercentage",
                    reason: format!("{} is above 100", pct),
                });
            }
        }

        if manifest.signature.certificate_chain.is_empty() {
            return Err(IntegrityError::InvalidManifestField {
                field: "signature",
                reason: "certificate chain is empty".to_string(),
            });
        }

        for delta in &manifest.deltas {
            if !is_content_hash(&delta.content_hash) {
                return Err(IntegrityError::InvalidManifestField {
                    field: "deltas.contentHash",
                    reason: format!("bad hash for delta from {}", delta.from_version),
                });
            }
        }

        debug!(version = %manifest.version, "Manifest shape verified");
        Ok(())
    }

    /// Verify the artifact signature and return the signer's identity.
    ///
    /// The leaf certificate must be genuine (fingerprint derived from its own
    /// key) and must match a trusted publisher on fingerprint, issuer and
    /// serial number. A matching common name alone is never enough.
    pub fn verify_signature(
        &self,
        artifact: &[u8],
        signature: &ArtifactSignature,
    ) -> Result<PublisherIdentity, IntegrityError> {
        let leaf = signature
            .leaf()
            .ok_or_else(|| IntegrityError::BrokenChain("no signing certificate".to_string()))?;

        if !leaf.fingerprint_matches_key() {
            error!(subject = %leaf.subject, "Signing certificate fingerprint is forged");
            return Err(IntegrityError::ForgedFingerprint {
                subject: leaf.subject.clone(),
            });
        }

        let identity = leaf.identity();
        if !self.trusted_publishers.iter().any(|p| p.matches(&identity)) {
            error!(
                common_name = %identity.common_name,
                fingerprint = %identity.fingerprint,
                issuer = %identity.issuer,
                "Artifact signed by untrusted publisher"
            );
            return Err(IntegrityError::UntrustedPublisher {
                common_name: identity.common_name,
                fingerprint: identity.fingerprint,
            });
        }

        let key_bytes = leaf
            .public_key_bytes()
            .ok_or_else(|| IntegrityError::SignatureInvalid("bad public key encoding".into()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)?;
        key.verify_strict(artifact, &signature.signature()?)?;

        self.verify_certificate_chain(&signature.certificate_chain)?;

        info!(
            common_name = %identity.common_name,
            fingerprint = %identity.fingerprint,
            "Artifact signature verified"
        );
        Ok(identity)
    }

    /// Walk the chain from the leaf to its root.
    ///
    /// Each record's issuer must name the next record's subject, every record
    /// must be inside its validity window, and the last record must be a
    /// self-signed root. When trusted roots are configured the root must be
    /// one of them.
    pub fn verify_certificate_chain(
        &self,
        chain: &[CertificateRecord],
    ) -> Result<(), IntegrityError> {
        if chain.is_empty() {
            return Err(IntegrityError::BrokenChain("empty chain".to_string()));
        }
        if chain.len() > MAX_CHAIN_DEPTH {
            return Err(IntegrityError::BrokenChain(format!(
                "chain longer than {} certificates",
                MAX_CHAIN_DEPTH
            )));
        }

        let now = self.clock.now();
        for cert in chain {
            if !cert.fingerprint_matches_key() {
                return Err(IntegrityError::ForgedFingerprint {
                    subject: cert.subject.clone(),
                });
            }
            if !cert.is_valid_at(now) {
                error!(subject = %cert.subject, valid_to = %cert.valid_to, "Certificate outside validity window");
                return Err(IntegrityError::CertificateExpired {
                    subject: cert.subject.clone(),
                });
            }
        }

        for pair in chain.windows(2) {
            let (child, parent) = (&pair[0], &pair[1]);
            if child.is_self_signed() {
                return Err(IntegrityError::BrokenChain(format!(
                    "`{}` is self-signed but not the last certificate",
                    child.subject
                )));
            }
            if child.issuer != parent.subject {
                return Err(IntegrityError::BrokenChain(format!(
                    "`{}` is issued by `{}`, next certificate is `{}`",
                    child.subject, child.issuer, parent.subject
                )));
            }
        }

        // `chain` is non-empty, checked above.
        let root = &chain[chain.len() - 1];
        if !root.is_self_signed() {
            return Err(IntegrityError::BrokenChain(format!(
                "chain ends at `{}` which is not self-signed",
                root.subject
            )));
        }

        if !self.trusted_roots.is_empty()
            && !self
                .trusted_roots
                .iter()
                .any(|fp| fingerprint_eq(fp, &root.fingerprint))
        {
            error!(root = %root.subject, fingerprint = %root.fingerprint, "Untrusted root certificate");
            return Err(IntegrityError::UntrustedRoot {
                fingerprint: root.fingerprint.clone(),
            });
        }

        debug!(depth = chain.len(), root = %root.subject, "Certificate chain verified");
        Ok(())
    }

    /// Check the certificate a host presented against its pins.
    ///
    /// A host without pins passes. A pinned host with no presented
    /// fingerprint or a fingerprint outside its pin set fails.
    pub fn verify_pinning(&self, host: &str, fingerprint: Option<&str>) -> Result<(), IntegrityError> {
        let Some(pins) = self.pins.pins_for(host) else {
            return Ok(());
        };

        let matched = fingerprint
            .map(|fp| pins.iter().any(|pin| fingerprint_eq(pin, fp)))
            .unwrap_or(false);

        if !matched {
            error!(host, presented = ?fingerprint, "Certificate pin mismatch");
            return Err(IntegrityError::PinMismatch {
                host: host.to_string(),
            });
        }

        debug!(host, "Certificate pin verified");
        Ok(())
    }

    /// Compare the SHA-512 of `bytes` against `expected` in constant time.
    pub fn verify_content_hash(&self, bytes: &[u8], expected: &str) -> Result<(), IntegrityError> {
        if !is_content_hash(expected) {
            return Err(IntegrityError::InvalidManifestField {
                field: "contentHash",
                reason: "not a SHA-512 hex digest".to_string(),
            });
        }
        let actual = content_hash(bytes);

        if actual.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
            error!(expected, actual = %actual, "Content hash mismatch");
            return Err(IntegrityError::HashMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// `actual` may differ from `expected` by at most `tolerance_percent`.
    pub fn verify_size(
        &self,
        actual: u64,
        expected: u64,
        tolerance_percent: u8,
    ) -> Result<(), IntegrityError> {
        let allowed = expected.saturating_mul(tolerance_percent as u64) / 100;
        if actual.abs_diff(expected) > allowed {
            error!(expected, actual, tolerance_percent, "Artifact size mismatch");
            return Err(IntegrityError::SizeMismatch { expected, actual });
        }
        Ok(())
    }

    /// Full check of a downloaded or reconstructed artifact: size, hash, then
    /// signature and chain.
    pub fn verify_artifact(
        &self,
        artifact: &[u8],
        manifest: &UpdateManifest,
        tolerance_percent: u8,
    ) -> Result<PublisherIdentity, IntegrityError> {
        self.verify_size(artifact.len() as u64, manifest.size, tolerance_percent)?;
        self.verify_content_hash(artifact, &manifest.content_hash)?;
        let identity = self.verify_signature(artifact, &manifest.signature)?;
        info!(version = %manifest.version, "Artifact verification complete");
        Ok(identity)
    }
}

/// Lowercase hex SHA-512 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha512::digest(bytes))
}

fn is_content_hash(value: &str) -> bool {
    value.len() == CONTENT_HASH_HEX_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
