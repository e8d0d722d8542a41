//! Testing utilities: a scripted in-memory transport, a recording installer
//! and signed release fixtures.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use ed25519_dalek::{Signer, SigningKey};
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use semver::Version;
use sha2::{Digest, Sha256};
use url::Url;

use crate::clock::FixedClock;
use crate::delta::BaseArtifactSource;
use crate::error::{DeltaError, NetworkError, UpdateError};
use crate::install::InstallerInvoker;
use crate::integrity::{content_hash, IntegrityVerifier};
use crate::manifest::{ArtifactSignature, ManifestSignature, SignedManifest, UpdateManifest};
use crate::transport::{FetchedDocument, TransferRequest, TransferResponse, Transport};
use crate::trust::{fingerprint_of, CertificateRecord, PinStore, TrustedPublisher};

/// A failure injected into the next request for a URL.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// The request fails before any body is produced
    Refuse(NetworkError),
    /// The body yields this many bytes, then a connection reset
    CutAfter(u64),
    /// The body yields this many bytes, then never produces another chunk
    StallAfter(u64),
    /// The transport panics while handling the request
    Panic,
}

/// In-memory transport serving fixed documents and resources.
pub struct MockTransport {
    resources: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<HashMap<String, VecDeque<ScriptedFailure>>>,
    requests: Mutex<Vec<TransferRequest>>,
    fetches: AtomicUsize,
    peer_fingerprint: Mutex<Option<String>>,
    supports_ranges: AtomicBool,
    strict_ranges: AtomicBool,
    hide_length: AtomicBool,
    chunk_size: usize,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            peer_fingerprint: Mutex::new(None),
            supports_ranges: AtomicBool::new(true),
            strict_ranges: AtomicBool::new(false),
            hide_length: AtomicBool::new(false),
            chunk_size: 64 * 1024,
        }
    }

    /// Configure the size of body chunks
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Serve `data` at `url`
    pub fn serve(&self, url: &str, data: impl Into<Bytes>) {
        self.resources.lock().insert(url.to_string(), data.into());
    }

    /// Fail the next request for `url`. Failures queue in order.
    pub fn fail_next(&self, url: &str, failure: ScriptedFailure) {
        self.failures
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Certificate fingerprint reported for every response
    pub fn set_peer_fingerprint(&self, fingerprint: Option<String>) {
        *self.peer_fingerprint.lock() = fingerprint;
    }

    /// Ignore range requests, always serving from byte zero
    pub fn set_supports_ranges(&self, supports: bool) {
        self.supports_ranges.store(supports, Ordering::Relaxed);
    }

    /// Answer 416 for range requests starting at or past the end, as HTTP
    /// servers do, instead of serving an empty body
    pub fn set_strict_ranges(&self, strict: bool) {
        self.strict_ranges.store(strict, Ordering::Relaxed);
    }

    /// Omit the resource length from responses
    pub fn hide_length(&self, hide: bool) {
        self.hide_length.store(hide, Ordering::Relaxed);
    }

    /// Stream requests received so far
    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().clone()
    }

    /// Stream requests received for `url`
    pub fn requests_for(&self, url: &str) -> Vec<TransferRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.as_str() == url)
            .cloned()
            .collect()
    }

    /// Number of whole-document fetches
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    fn next_failure(&self, url: &Url) -> Option<ScriptedFailure> {
        self.failures
            .lock()
            .get_mut(url.as_str())
            .and_then(|queue| queue.pop_front())
    }

    fn resource(&self, url: &Url) -> Result<Bytes, NetworkError> {
        self.resources
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or(NetworkError::Status { status: 404 })
    }

    fn chunks(&self, data: Bytes) -> Vec<Result<Bytes, NetworkError>> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.chunk_size).min(data.len());
            out.push(Ok(data.slice(offset..end)));
            offset = end;
        }
        out
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, url: &Url) -> Result<FetchedDocument, NetworkError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        match self.next_failure(url) {
            Some(ScriptedFailure::Refuse(err)) => return Err(err),
            Some(ScriptedFailure::Panic) => panic!("scripted transport panic for {}", url),
            Some(_) => {
                return Err(NetworkError::Connection("connection reset".to_string()));
            }
            None => {}
        }
        Ok(FetchedDocument {
            body: self.resource(url)?,
            peer_fingerprint: self.peer_fingerprint.lock().clone(),
        })
    }

    async fn open(&self, request: &TransferRequest) -> Result<TransferResponse, NetworkError> {
        self.requests.lock().push(request.clone());
        let failure = self.next_failure(&request.url);
        match &failure {
            Some(ScriptedFailure::Refuse(err)) => return Err(err.clone()),
            Some(ScriptedFailure::Panic) => {
                panic!("scripted transport panic for {}", request.url)
            }
            _ => {}
        }

        let data = self.resource(&request.url)?;
        if self.strict_ranges.load(Ordering::Relaxed)
            && self.supports_ranges.load(Ordering::Relaxed)
            && request.offset > 0
            && request.offset >= data.len() as u64
        {
            return Err(NetworkError::Status { status: 416 });
        }
        let offset = if self.supports_ranges.load(Ordering::Relaxed) {
            request.offset.min(data.len() as u64)
        } else {
            0
        };
        let total = data.len() as u64;
        let remaining = data.slice(offset as usize..);

        let body = match failure {
            Some(ScriptedFailure::CutAfter(n)) => {
                let cut = (n as usize).min(remaining.len());
                let mut chunks = self.chunks(remaining.slice(..cut));
                chunks.push(Err(NetworkError::Connection("connection reset".to_string())));
                stream::iter(chunks).boxed()
            }
            Some(ScriptedFailure::StallAfter(n)) => {
                let cut = (n as usize).min(remaining.len());
                stream::iter(self.chunks(remaining.slice(..cut)))
                    .chain(stream::pending())
                    .boxed()
            }
            _ => stream::iter(self.chunks(remaining)).boxed(),
        };

        Ok(TransferResponse {
            offset,
            total: if self.hide_length.load(Ordering::Relaxed) {
                None
            } else {
                Some(total)
            },
            peer_fingerprint: self.peer_fingerprint.lock().clone(),
            body,
        })
    }
}

/// One recorded installer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallCall {
    pub artifact: PathBuf,
    pub artifact_bytes: Vec<u8>,
    pub is_silent: bool,
    pub force_restart: bool,
}

/// Installer that records its invocations.
#[derive(Debug, Default)]
pub struct RecordingInstaller {
    calls: Mutex<Vec<InstallCall>>,
    fail: AtomicBool,
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent installs fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<InstallCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl InstallerInvoker for RecordingInstaller {
    async fn install_and_restart(
        &self,
        artifact: &Path,
        is_silent: bool,
        force_restart: bool,
    ) -> Result<(), UpdateError> {
        let artifact_bytes = tokio::fs::read(artifact).await?;
        self.calls.lock().push(InstallCall {
            artifact: artifact.to_path_buf(),
            artifact_bytes,
            is_silent,
            force_restart,
        });
        if self.fail.load(Ordering::Relaxed) {
            return Err(UpdateError::Installer("scripted failure".to_string()));
        }
        Ok(())
    }
}

/// Base artifact held in memory. Counts how often it was asked for.
#[derive(Debug)]
pub struct StaticBaseSource {
    version: Version,
    bytes: Bytes,
    loads: AtomicUsize,
}

impl StaticBaseSource {
    pub fn new(version: Version, bytes: impl Into<Bytes>) -> Self {
        Self {
            version,
            bytes: bytes.into(),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BaseArtifactSource for StaticBaseSource {
    async fn load_base(&self, version: &Version) -> Result<Bytes, DeltaError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if *version != self.version {
            return Err(DeltaError::BaseUnavailable(format!(
                "no base for {} (have {})",
                version, self.version
            )));
        }
        Ok(self.bytes.clone())
    }
}

/// A signed release: artifact bytes, manifest and the keys behind them.
#[derive(Debug, Clone)]
pub struct ReleaseFixture {
    pub manifest: UpdateManifest,
    pub artifact: Vec<u8>,
    pub publisher_key: SigningKey,
    pub root_key: SigningKey,
    /// Publisher chain, leaf first
    pub chain: Vec<CertificateRecord>,
}

impl ReleaseFixture {
    pub const PUBLISHER_NAME: &'static str = "Example Software Inc";
    pub const ROOT_NAME: &'static str = "Example Root CA";
    pub const PUBLISHER_SERIAL: &'static str = "4f:2a:91";

    /// Instant all fixture certificates and envelopes are valid at.
    pub fn reference_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Key that signs manifest envelopes.
    pub fn manifest_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    /// Deterministic pseudo-random artifact bytes for `seed`.
    pub fn sample_artifact(seed: &str, size: usize) -> Vec<u8> {
        let seed_bytes: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
        let mut rng = StdRng::from_seed(seed_bytes);
        let mut data = vec![0u8; size];
        rng.fill_bytes(&mut data);
        data
    }

    /// Release `version` with a generated artifact of `size` bytes.
    pub fn new(version: &str, size: usize) -> Self {
        Self::with_artifact(version, Self::sample_artifact(version, size))
    }

    /// Release `version` shipping exactly `artifact`.
    pub fn with_artifact(version: &str, artifact: Vec<u8>) -> Self {
        let version = Version::parse(version).unwrap_or_else(|_| Version::new(0, 0, 0));
        let publisher_key = SigningKey::from_bytes(&[11u8; 32]);
        let root_key = SigningKey::from_bytes(&[13u8; 32]);
        let chain = vec![
            Self::certificate(
                Self::PUBLISHER_NAME,
                Self::ROOT_NAME,
                &publisher_key,
                Self::PUBLISHER_SERIAL,
            ),
            Self::certificate(Self::ROOT_NAME, Self::ROOT_NAME, &root_key, "01"),
        ];

        let manifest = UpdateManifest {
            version: version.clone(),
            release_date: Self::reference_time() - Duration::days(1),
            artifact_path: format!("releases/app-{}.bin", version),
            size: artifact.len() as u64,
            content_hash: content_hash(&artifact),
            signature: ArtifactSignature {
                value: String::new(),
                certificate_chain: chain.clone(),
            },
            minimum_version: None,
            mandatory: None,
            staging_percentage: None,
            release_notes: format!("Release {}", version),
            deltas: Vec::new(),
        };

        let mut fixture = Self {
            manifest,
            artifact,
            publisher_key,
            root_key,
            chain,
        };
        fixture.resign();
        fixture
    }

    /// Certificate record for `key`, valid for a year around the reference time.
    pub fn certificate(
        subject: &str,
        issuer: &str,
        key: &SigningKey,
        serial: &str,
    ) -> CertificateRecord {
        let public_key = key.verifying_key().to_bytes();
        CertificateRecord {
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            fingerprint: fingerprint_of(&public_key),
            serial_number: serial.to_string(),
            valid_from: Self::reference_time() - Duration::days(180),
            valid_to: Self::reference_time() + Duration::days(180),
            public_key: hex::encode(public_key),
        }
    }

    /// Recompute size, hash and signature after changing the artifact,
    /// publisher key or chain.
    pub fn resign(&mut self) {
        let signature = self.publisher_key.sign(&self.artifact);
        self.manifest.size = self.artifact.len() as u64;
        self.manifest.content_hash = content_hash(&self.artifact);
        self.manifest.signature = ArtifactSignature {
            value: hex::encode(signature.to_bytes()),
            certificate_chain: self.chain.clone(),
        };
    }

    pub fn trusted_publisher(&self) -> TrustedPublisher {
        TrustedPublisher {
            fingerprint: self.chain[0].fingerprint.clone(),
            issuer: self.chain[0].issuer.clone(),
            serial_number: self.chain[0].serial_number.clone(),
        }
    }

    pub fn root_fingerprint(&self) -> String {
        self.chain[self.chain.len() - 1].fingerprint.clone()
    }

    /// Verifier trusting this fixture's publisher and root, at the reference time.
    pub fn verifier(&self) -> IntegrityVerifier {
        self.verifier_with_pins(PinStore::new())
    }

    pub fn verifier_with_pins(&self, pins: PinStore) -> IntegrityVerifier {
        IntegrityVerifier::new(
            vec![self.trusted_publisher()],
            vec![self.root_fingerprint()],
            pins,
            Arc::new(FixedClock::new(Self::reference_time())),
        )
    }

    /// Manifest envelope signed by [`Self::manifest_key`] at `timestamp`.
    pub fn signed_envelope(&self, timestamp: DateTime<Utc>) -> Vec<u8> {
        let json = serde_json::to_string(&self.manifest).unwrap_or_default();
        let signature = Self::manifest_key().sign(json.as_bytes());
        let envelope = SignedManifest::new(
            json,
            vec![ManifestSignature::new("release-1".to_string(), &signature)],
            timestamp.timestamp(),
        );
        serde_json::to_vec(&envelope).unwrap_or_default()
    }
}
