//! # update-engine
//!
//! Secure update client engine for desktop applications.
//!
//! This crate handles:
//! - Signed manifest retrieval over a host allow-list with certificate pinning
//! - Staged rollout bucketing from a persistent installation identity
//! - Version policy: mandatory updates, minimum versions and rollback releases
//! - Differential (delta) transfer with fallback to the full artifact
//! - Resumable downloads with retry, backoff and per-chunk timeouts
//! - The update lifecycle state machine and its event stream
//!
//! ## Security
//!
//! Nothing downloaded is trusted until verified:
//! - Manifests are checked against configured Ed25519 keys and a signature threshold
//! - Publishers are matched by certificate fingerprint, never by name alone
//! - Artifacts are size-checked, SHA-512 hashed and signature-verified before staging
//! - Failed attempts leave no partial or staged bytes behind

pub mod cache;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod controller;
pub mod delta;
pub mod download;
pub mod error;
pub mod events;
pub mod feed;
pub mod install;
pub mod integrity;
pub mod manifest;
pub mod policy;
#[cfg(test)]
mod proptests;
pub mod rollout;
pub mod testing;
pub mod transport;
pub mod trust;

// Re-export main types for convenience
pub use cache::DownloadCache;
pub use cancel::CancellationToken;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{EngineConfig, FeedConfig, InstallConfig, NetworkConfig, SecurityConfig};
pub use controller::{
    AttemptOutcome, ControllerDeps, ControllerOptions, UpdateController, UpdateLifecycleState,
};
pub use delta::{
    BaseArtifactSource, DeltaDescriptor, DeltaUpdatePlanner, FileBaseSource, TransferPlan,
};
pub use download::{
    BackoffPolicy, DownloadCoordinator, DownloadProgress, DownloadRequest, DownloadSession,
    Jitter, NoJitter, RandJitter, SessionState,
};
pub use error::{
    DeltaError, ErrorKind, IntegrityError, ManifestError, NetworkError, PolicyError, UpdateError,
};
pub use events::{EventReceiver, EventSink, UpdateEvent};
pub use feed::ManifestFeed;
pub use install::{CommandInstaller, InstallerInvoker};
pub use integrity::IntegrityVerifier;
pub use manifest::{
    ArtifactSignature, DeltaEntry, ManifestSignature, ManifestSummary, ManifestVerifier,
    SignedManifest, UpdateManifest,
};
pub use policy::{Transition, VersionPolicyEngine};
pub use rollout::{InstallationIdentity, RolloutDecision, RolloutGate};
pub use transport::{HttpTransport, Transport};
pub use trust::{CertificateRecord, PinStore, PublisherIdentity, TrustedPublisher};
