//! Property-based tests for update-engine.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Property 1: Rollout bucketing is deterministic and bounded
//! - Property 2: Staging percentage admits the expected share of installations
//! - Property 3: Versions never move backwards
//! - Property 4: Delta reconstruction reproduces the target exactly
//! - Property 5: Corrupted deltas are rejected without touching the base
//! - Property 6: Manifest envelopes only verify under the signing key
//! - Property 7: Any flipped artifact bit fails the content hash

#![cfg(test)]

use std::sync::Arc;

use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use proptest::prelude::*;
use semver::Version;

use crate::clock::FixedClock;
use crate::delta::{DeltaDescriptor, DeltaUpdatePlanner};
use crate::error::{PolicyError, UpdateError};
use crate::integrity::content_hash;
use crate::manifest::{DeltaEntry, ManifestSignature, ManifestVerifier, SignedManifest};
use crate::policy::VersionPolicyEngine;
use crate::rollout::{InstallationIdentity, RolloutGate};
use crate::testing::ReleaseFixture;

// =============================================================================
// Generators
// =============================================================================

/// Generate a random Ed25519 signing key from 32 random bytes.
fn arb_signing_key() -> impl Strategy<Value = SigningKey> {
    prop::array::uniform32(any::<u8>()).prop_map(|bytes| SigningKey::from_bytes(&bytes))
}

/// Generate a random version.
fn arb_version() -> impl Strategy<Value = Version> {
    (0u64..100, 0u64..100, 0u64..100)
        .prop_map(|(major, minor, patch)| Version::new(major, minor, patch))
}

fn arb_identity() -> impl Strategy<Value = InstallationIdentity> {
    "[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{12}".prop_map(InstallationIdentity::new)
}

/// Base and target that share some content, like consecutive releases.
fn arb_release_pair() -> impl Strategy<Value = (Vec<u8>, Vec<u8>)> {
    (
        prop::collection::vec(any::<u8>(), 0..2048),
        prop::collection::vec(any::<u8>(), 0..512),
        prop::collection::vec(any::<u8>(), 0..512),
        prop::collection::vec(any::<u8>(), 0..2048),
    )
        .prop_map(|(shared_head, old_mid, new_mid, shared_tail)| {
            let base = [shared_head.as_slice(), &old_mid, &shared_tail].concat();
            let target = [shared_head.as_slice(), &new_mid, &shared_tail].concat();
            (base, target)
        })
}

// =============================================================================
// Helper Functions
// =============================================================================

fn planner() -> DeltaUpdatePlanner {
    DeltaUpdatePlanner::new(Arc::new(ReleaseFixture::new("1.0.0", 16).verifier()))
}

fn descriptor(delta: Bytes) -> DeltaDescriptor {
    let mut d = DeltaDescriptor::from_entry(
        &DeltaEntry {
            from_version: Version::new(1, 0, 0),
            path: "deltas/1.0.0-1.0.1.delta".into(),
            size: delta.len() as u64,
            content_hash: content_hash(&delta),
        },
        &Version::new(1, 0, 1),
    );
    d.load(delta);
    d
}

fn envelope(key: &SigningKey) -> Vec<u8> {
    let fixture = ReleaseFixture::new("2.0.1", 64);
    let json = serde_json::to_string(&fixture.manifest).unwrap();
    let signature = key.sign(json.as_bytes());
    let signed = SignedManifest::new(
        json,
        vec![ManifestSignature::new("k1".to_string(), &signature)],
        ReleaseFixture::reference_time().timestamp(),
    );
    serde_json::to_vec(&signed).unwrap()
}

fn manifest_verifier(key: &SigningKey) -> ManifestVerifier {
    ManifestVerifier::new(
        vec![key.verifying_key()],
        1,
        chrono::Duration::days(7),
        Arc::new(FixedClock::new(ReleaseFixture::reference_time())),
    )
    .unwrap()
}

// =============================================================================
// Property 1: Rollout Bucketing
//
// *For any* installation and release, the bucket is a pure function of the
// pair and lies in 0..100.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_bucket_deterministic(identity in arb_identity(), version in arb_version()) {
        let gate = RolloutGate::new();
        let first = gate.bucket(&identity, &version);
        let second = gate.bucket(&identity.clone(), &version);
        prop_assert_eq!(first, second);
        prop_assert!(first < 100);
    }

    #[test]
    fn prop_admission_monotonic(
        identity in arb_identity(),
        version in arb_version(),
        low in 0u8..=100,
        extra in 0u8..=100,
    ) {
        // Raising the percentage never evicts an admitted installation.
        let gate = RolloutGate::new();
        let high = low.saturating_add(extra);
        if gate.decide(&identity, low, &version).admitted {
            prop_assert!(gate.decide(&identity, high, &version).admitted);
        }
    }
}

// =============================================================================
// Property 2: Staging Distribution
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    #[test]
    fn prop_staging_share(version in arb_version()) {
        let gate = RolloutGate::new();
        let identities: Vec<InstallationIdentity> = (0..1000)
            .map(|i| InstallationIdentity::new(format!("installation-{:04}", i)))
            .collect();

        let admitted = |pct: u8| {
            identities
                .iter()
                .filter(|id| gate.decide(id, pct, &version).admitted)
                .count()
        };

        prop_assert_eq!(admitted(0), 0);
        prop_assert_eq!(admitted(100), 1000);
        let share = admitted(20);
        prop_assert!((150..=250).contains(&share), "20% admitted {} of 1000", share);
    }
}

// =============================================================================
// Property 3: No Downgrades
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_downgrade_rejected(a in arb_version(), b in arb_version(), mandatory in any::<bool>()) {
        prop_assume!(a != b);
        let (current, candidate) = if a > b { (a, b) } else { (b, a) };

        let mut fixture = ReleaseFixture::new("1.0.0", 16);
        fixture.manifest.version = candidate;
        fixture.manifest.mandatory = Some(mandatory);

        let result = VersionPolicyEngine::new().validate_transition(&current, &fixture.manifest);
        let is_downgrade = matches!(result, Err(PolicyError::Downgrade { .. }));
        prop_assert!(is_downgrade, "expected downgrade rejection, got {:?}", result);
    }

    #[test]
    fn prop_upgrade_permitted(a in arb_version(), b in arb_version()) {
        prop_assume!(a != b);
        let (candidate, current) = if a > b { (a, b) } else { (b, a) };

        let mut fixture = ReleaseFixture::new("1.0.0", 16);
        fixture.manifest.version = candidate.clone();

        let engine = VersionPolicyEngine::new();
        prop_assert!(engine.is_upgrade(&current, &candidate));
        prop_assert!(engine.validate_transition(&current, &fixture.manifest).is_ok());
    }
}

// =============================================================================
// Property 4: Delta Round Trip
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_delta_reconstructs_target((base, target) in arb_release_pair()) {
        let delta = DeltaUpdatePlanner::generate_delta(&base, &target);
        let mut d = descriptor(delta);

        let out = planner().apply_delta(&base, &mut d).unwrap();
        prop_assert_eq!(content_hash(&out), content_hash(&target));
        prop_assert!(!d.is_loaded());
    }

    // =========================================================================
    // Property 5: Corrupted Delta Rejected
    // =========================================================================

    #[test]
    fn prop_corrupted_header_rejected(
        (base, target) in arb_release_pair(),
        index in 0usize..89,
        mask in 1u8..=255,
    ) {
        let mut raw = DeltaUpdatePlanner::generate_delta(&base, &target).to_vec();
        raw[index] ^= mask;
        // Re-advertise the corrupted bytes so only the header checks stand.
        let mut d = descriptor(Bytes::from(raw));

        let original = base.clone();
        prop_assert!(planner().apply_delta(&base, &mut d).is_err());
        prop_assert_eq!(base, original);
        prop_assert!(!d.is_loaded());
    }
}

// =============================================================================
// Property 6: Manifest Signature Verification
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_valid_signature_accepted(key in arb_signing_key()) {
        let result = manifest_verifier(&key).verify_and_parse(&envelope(&key));
        prop_assert!(result.is_ok(), "valid envelope rejected: {:?}", result.err());
    }

    #[test]
    fn prop_foreign_signature_rejected(signer in arb_signing_key(), trusted in arb_signing_key()) {
        prop_assume!(signer.to_bytes() != trusted.to_bytes());
        let result = manifest_verifier(&trusted).verify_and_parse(&envelope(&signer));
        prop_assert!(matches!(result, Err(UpdateError::Integrity(_))), "got {:?}", result);
    }
}

// =============================================================================
// Property 7: Content Hash
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_bit_flip_detected(
        data in prop::collection::vec(any::<u8>(), 1..4096),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let verifier = ReleaseFixture::new("1.0.0", 16).verifier();
        let expected = content_hash(&data);
        prop_assert!(verifier.verify_content_hash(&data, &expected).is_ok());

        let mut corrupted = data.clone();
        let i = index.index(corrupted.len());
        corrupted[i] ^= 1 << bit;
        prop_assert!(verifier.verify_content_hash(&corrupted, &expected).is_err());
    }
}
