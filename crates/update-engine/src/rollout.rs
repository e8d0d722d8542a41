//! Staged rollout admission.
//!
//! An installation lands in a bucket `0..100` derived from its identity and
//! the candidate version, and is admitted when the bucket is below the
//! manifest's staging percentage. The bucket depends on nothing else, so a
//! user's admission for a version never flips between checks.

use std::fmt;
use std::path::Path;

use semver::Version;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::UpdateError;

/// Stable, opaque per-installation identifier.
///
/// Created once and persisted. Only ever used as hashing input; `Debug`
/// redacts it so it cannot reach the logs.
#[derive(Clone, PartialEq, Eq)]
pub struct InstallationIdentity(String);

impl InstallationIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Read the identity at `path`, creating and persisting one if the file
    /// is missing or empty.
    pub fn load_or_create(path: &Path) -> Result<Self, UpdateError> {
        match std::fs::read_to_string(path) {
            Ok(contents) if !contents.trim().is_empty() => {
                return Ok(Self(contents.trim().to_string()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let identity = Self::generate();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &identity.0)?;
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), "Created installation identity");
        Ok(identity)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for InstallationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InstallationIdentity(..)")
    }
}

/// Result of a rollout check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutDecision {
    /// Bucket in `0..100`
    pub bucket_value: u8,
    pub admitted: bool,
}

/// Deterministic rollout gate.
#[derive(Debug, Default, Clone, Copy)]
pub struct RolloutGate;

impl RolloutGate {
    pub fn new() -> Self {
        Self
    }

    /// Bucket of `identity` for `version`: first 8 bytes of
    /// SHA-256(identity || version) as a big-endian integer, modulo 100.
    pub fn bucket(&self, identity: &InstallationIdentity, version: &Version) -> u8 {
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        hasher.update(version.to_string().as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % 100) as u8
    }

    /// Admit when the bucket is below `staging_percentage`. Zero halts the
    /// rollout; 100 or more admits everyone.
    pub fn decide(
        &self,
        identity: &InstallationIdentity,
        staging_percentage: u8,
        version: &Version,
    ) -> RolloutDecision {
        let bucket_value = self.bucket(identity, version);
        let decision = RolloutDecision {
            bucket_value,
            admitted: bucket_value < staging_percentage,
        };
        debug!(
            version = %version,
            bucket = bucket_value,
            staging_percentage,
            admitted = decision.admitted,
            "Rollout decision"
        );
        decision
    }
}
