//! Version ordering policy.
//!
//! Versions only move forward. A broken release is retired by shipping a
//! higher version with `minimumVersion` set to the broken one
//! ("rollback-as-upgrade"); a lower version number is never installed.

use semver::Version;
use tracing::{error, info};

use crate::error::PolicyError;
use crate::manifest::UpdateManifest;

/// Outcome of validating a manifest against the running version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Candidate equals the running version
    UpToDate,
    /// Candidate is newer
    Upgrade {
        /// Install without asking the user
        mandatory: bool,
        /// Manifest retires the running version; always implies `mandatory`
        rollback_as_upgrade: bool,
    },
}

impl Transition {
    /// Whether the user-consent step is skipped.
    pub fn skips_consent(&self) -> bool {
        matches!(self, Transition::Upgrade { mandatory: true, .. })
    }
}

/// Stateless version policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct VersionPolicyEngine;

impl VersionPolicyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Strictly newer by MAJOR.MINOR.PATCH comparison.
    pub fn is_upgrade(&self, current: &Version, candidate: &Version) -> bool {
        (candidate.major, candidate.minor, candidate.patch)
            > (current.major, current.minor, current.patch)
    }

    /// True if the manifest is flagged mandatory, or the running version is
    /// at or below its minimum. A release that retires the running version
    /// is forced onto it.
    pub fn requires_mandatory_install(&self, manifest: &UpdateManifest, current: &Version) -> bool {
        if manifest.is_mandatory() || self.is_rollback_eligible(current, manifest) {
            return true;
        }
        match &manifest.minimum_version {
            Some(minimum) => self.is_upgrade(current, minimum),
            None => false,
        }
    }

    /// True only when the manifest retires exactly the running version.
    pub fn is_rollback_eligible(&self, current: &Version, manifest: &UpdateManifest) -> bool {
        manifest
            .minimum_version
            .as_ref()
            .map(|minimum| same_release(minimum, current))
            .unwrap_or(false)
    }

    /// Decide what the manifest means for this installation.
    pub fn validate_transition(
        &self,
        current: &Version,
        manifest: &UpdateManifest,
    ) -> Result<Transition, PolicyError> {
        if let Some(minimum) = &manifest.minimum_version {
            if self.is_upgrade(&manifest.version, minimum) {
                error!(
                    minimum = %minimum,
                    release = %manifest.version,
                    "Manifest minimum version is above its release"
                );
                return Err(PolicyError::MinimumAboveRelease {
                    minimum: minimum.to_string(),
                    release: manifest.version.to_string(),
                });
            }
        }

        if same_release(current, &manifest.version) {
            return Ok(Transition::UpToDate);
        }

        if !self.is_upgrade(current, &manifest.version) {
            error!(
                current = %current,
                candidate = %manifest.version,
                "Downgrade rejected"
            );
            return Err(PolicyError::Downgrade {
                current: current.to_string(),
                candidate: manifest.version.to_string(),
            });
        }

        let transition = Transition::Upgrade {
            mandatory: self.requires_mandatory_install(manifest, current),
            rollback_as_upgrade: self.is_rollback_eligible(current, manifest),
        };
        info!(
            current = %current,
            candidate = %manifest.version,
            ?transition,
            "Upgrade permitted"
        );
        Ok(transition)
    }
}

fn same_release(a: &Version, b: &Version) -> bool {
    (a.major, a.minor, a.patch) == (b.major, b.minor, b.patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ReleaseFixture;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn manifest(version: &str, minimum: Option<&str>, mandatory: Option<bool>) -> UpdateManifest {
        let mut m = ReleaseFixture::new(version, 1_000_000).manifest;
        m.minimum_version = minimum.map(v);
        m.mandatory = mandatory;
        m
    }

    #[test]
    fn test_is_upgrade() {
        let policy = VersionPolicyEngine::new();
        assert!(!policy.is_upgrade(&v("2.0.0"), &v("1.9.9")));
        assert!(policy.is_upgrade(&v("2.0.0"), &v("2.0.1")));
        assert!(!policy.is_upgrade(&v("2.0.0"), &v("2.0.0")));
        assert!(policy.is_upgrade(&v("1.9.9"), &v("1.10.0")));
        assert!(!policy.is_upgrade(&v("10.0.0"), &v("9.99.99")));
    }

    #[test]
    fn test_requires_mandatory_install() {
        let policy = VersionPolicyEngine::new();
        let current = v("2.0.0");

        assert!(!policy.requires_mandatory_install(&manifest("2.0.1", None, None), &current));
        assert!(policy.requires_mandatory_install(&manifest("2.0.1", None, Some(true)), &current));
        assert!(policy.requires_mandatory_install(&manifest("2.1.0", Some("2.0.1"), None), &current));
        assert!(policy.requires_mandatory_install(&manifest("2.1.0", Some("2.0.0"), None), &current));
        assert!(!policy.requires_mandatory_install(&manifest("2.1.0", Some("1.9.0"), None), &current));
        assert!(policy.requires_mandatory_install(
            &manifest("2.0.1", Some("2.0.0"), Some(true)),
            &current
        ));
    }

    #[test]
    fn test_rollback_eligible_only_for_exact_minimum() {
        let policy = VersionPolicyEngine::new();
        let current = v("2.0.0");
        assert!(policy.is_rollback_eligible(&current, &manifest("2.0.1", Some("2.0.0"), None)));
        assert!(!policy.is_rollback_eligible(&current, &manifest("2.0.1", Some("1.9.0"), None)));
        assert!(!policy.is_rollback_eligible(&current, &manifest("2.0.1", None, None)));
    }

    #[test]
    fn test_validate_transition() {
        let policy = VersionPolicyEngine::new();
        let current = v("2.0.0");

        assert_eq!(
            policy.validate_transition(&current, &manifest("2.0.0", None, None)),
            Ok(Transition::UpToDate)
        );
        assert!(matches!(
            policy.validate_transition(&current, &manifest("1.9.9", None, None)),
            Err(PolicyError::Downgrade { .. })
        ));
        assert!(matches!(
            policy.validate_transition(&current, &manifest("2.0.1", Some("2.1.0"), None)),
            Err(PolicyError::MinimumAboveRelease { .. })
        ));

        let transition = policy
            .validate_transition(&current, &manifest("2.0.1", Some("2.0.0"), Some(true)))
            .unwrap();
        assert_eq!(
            transition,
            Transition::Upgrade {
                mandatory: true,
                rollback_as_upgrade: true
            }
        );
        assert!(transition.skips_consent());

        // Retiring the running version is enough to skip consent.
        let retired = policy
            .validate_transition(&current, &manifest("2.0.1", Some("2.0.0"), Some(false)))
            .unwrap();
        assert_eq!(
            retired,
            Transition::Upgrade {
                mandatory: true,
                rollback_as_upgrade: true
            }
        );
        assert!(retired.skips_consent());

        let optional = policy
            .validate_transition(&current, &manifest("2.1.0", None, None))
            .unwrap();
        assert!(!optional.skips_consent());
    }
}
