//! Update lifecycle controller - orchestrates one update attempt at a time.
//!
//! ```text
//! Idle -> Checking -> Available -> Downloading -> Verifying -> ReadyToInstall -> Installing -> Idle
//!            |            |                                        (any) -> Failed -> Idle
//!            +-> Idle     +-> Idle (declined)
//! ```
//!
//! Concurrent [`UpdateController::check_for_updates`] calls share the result
//! of the attempt already in flight. The attempt runs on its own task, so a
//! caller that goes away does not abort it; [`UpdateController::cancel`] does.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use semver::Version;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::cache::DownloadCache;
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::delta::{BaseArtifactSource, DeltaDescriptor, DeltaUpdatePlanner, TransferPlan};
use crate::download::{
    DownloadCoordinator, DownloadProgress, DownloadRequest, DownloadSession, Jitter,
    ProgressCallback,
};
use crate::error::{DeltaError, UpdateError};
use crate::events::{EventReceiver, EventSink, UpdateEvent};
use crate::feed::ManifestFeed;
use crate::install::InstallerInvoker;
use crate::integrity::IntegrityVerifier;
use crate::manifest::{ManifestSummary, ManifestVerifier, UpdateManifest};
use crate::policy::{Transition, VersionPolicyEngine};
use crate::rollout::{InstallationIdentity, RolloutDecision, RolloutGate};
use crate::transport::Transport;

/// Lifecycle state. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateLifecycleState {
    Idle,
    Checking,
    Available,
    Downloading,
    Verifying,
    ReadyToInstall,
    Installing,
    Failed,
}

impl UpdateLifecycleState {
    /// Whether the state machine may move from `self` to `next`.
    ///
    /// Every state may fail or return to `Idle`. `Verifying -> Downloading`
    /// is the fallback from a rejected delta to the full artifact.
    pub fn can_transition_to(self, next: UpdateLifecycleState) -> bool {
        use UpdateLifecycleState::*;
        if self == next {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (_, Idle)
                | (Idle, Checking)
                | (Checking, Available)
                | (Available, Downloading)
                | (Downloading, Verifying)
                | (Verifying, Downloading)
                | (Verifying, ReadyToInstall)
                | (ReadyToInstall, Installing)
        )
    }
}

impl Default for UpdateLifecycleState {
    fn default() -> Self {
        Self::Idle
    }
}

/// How a [`UpdateController::check_for_updates`] call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Running version is the latest
    UpToDate,
    /// An update exists but this installation is outside the rollout
    NotAdmitted(RolloutDecision),
    /// The user declined the update
    Declined,
    /// A verified artifact is staged and waiting for installation
    ReadyToInstall(ManifestSummary),
}

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub current_version: Version,
    pub size_tolerance_percent: u8,
    pub auto_install_on_quit: bool,
    pub silent: bool,
    pub force_restart: bool,
}

impl ControllerOptions {
    pub fn from_config(config: &EngineConfig, current_version: Version) -> Self {
        Self {
            current_version,
            size_tolerance_percent: config.security.size_tolerance_percent,
            auto_install_on_quit: config.install.auto_install_on_quit,
            silent: config.install.silent,
            force_restart: config.install.force_restart,
        }
    }
}

/// Collaborators injected into the controller.
pub struct ControllerDeps {
    pub transport: Arc<dyn Transport>,
    pub installer: Arc<dyn InstallerInvoker>,
    pub clock: Arc<dyn Clock>,
    pub jitter: Arc<dyn Jitter>,
    pub base_source: Option<Arc<dyn BaseArtifactSource>>,
    pub identity: InstallationIdentity,
}

/// A verified artifact waiting for installation.
#[derive(Debug, Clone)]
struct StagedUpdate {
    summary: ManifestSummary,
    path: PathBuf,
}

#[derive(Debug, Default)]
struct Status {
    state: UpdateLifecycleState,
    session: Option<DownloadSession>,
    staged: Option<StagedUpdate>,
}

type AttemptFuture = Shared<BoxFuture<'static, Result<AttemptOutcome, UpdateError>>>;

/// Drives the update lifecycle.
///
/// # Example
///
/// ```ignore
/// let (controller, mut events) = UpdateController::new(&config, current, deps)?;
/// match controller.check_for_updates().await? {
///     AttemptOutcome::ReadyToInstall(summary) => controller.install_now().await?,
///     _ => {}
/// }
/// ```
#[derive(Clone)]
pub struct UpdateController {
    inner: Arc<Inner>,
}

struct Inner {
    options: ControllerOptions,
    identity: InstallationIdentity,
    feed: ManifestFeed,
    integrity: Arc<IntegrityVerifier>,
    policy: VersionPolicyEngine,
    rollout: RolloutGate,
    planner: Arc<DeltaUpdatePlanner>,
    downloader: DownloadCoordinator,
    base_source: Option<Arc<dyn BaseArtifactSource>>,
    installer: Arc<dyn InstallerInvoker>,
    events: EventSink,
    status: Arc<Mutex<Status>>,
    in_flight: Mutex<Option<(u64, AttemptFuture)>>,
    next_attempt: AtomicU64,
    consent: Mutex<Option<oneshot::Sender<bool>>>,
    cancel: Mutex<CancellationToken>,
}

impl UpdateController {
    /// Build a controller and the receiver for its events.
    ///
    /// Purges anything a previous process left in the download cache.
    pub fn new(
        config: &EngineConfig,
        current_version: Version,
        deps: ControllerDeps,
    ) -> Result<(Self, EventReceiver), UpdateError> {
        config.validate()?;
        let security = &config.security;

        let integrity = Arc::new(IntegrityVerifier::new(
            security.trusted_publishers.clone(),
            security.trusted_roots.clone(),
            security.pin_store(),
            deps.clock.clone(),
        ));
        let verifier = ManifestVerifier::new(
            security.parse_manifest_keys()?,
            security.signature_threshold,
            security.max_manifest_age(),
            deps.clock.clone(),
        )?;
        let feed = ManifestFeed::new(
            &config.feed.url,
            config.feed.allowed_hosts.clone(),
            deps.transport.clone(),
            verifier,
            integrity.clone(),
            config.feed.fetch_timeout(),
            config.network.backoff_policy(),
            deps.jitter.clone(),
        )?;

        let cache = DownloadCache::new(config.cache_dir());
        cache.purge_stale()?;
        let downloader = DownloadCoordinator::new(
            deps.transport,
            integrity.clone(),
            cache,
            config.network.backoff_policy(),
            deps.jitter,
            config.network.chunk_timeout(),
        );

        let (events, receiver) = EventSink::channel();
        let inner = Inner {
            options: ControllerOptions::from_config(config, current_version),
            identity: deps.identity,
            feed,
            planner: Arc::new(DeltaUpdatePlanner::new(integrity.clone())),
            integrity,
            policy: VersionPolicyEngine::new(),
            rollout: RolloutGate::new(),
            downloader,
            base_source: deps.base_source,
            installer: deps.installer,
            events,
            status: Arc::new(Mutex::new(Status::default())),
            in_flight: Mutex::new(None),
            next_attempt: AtomicU64::new(1),
            consent: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        };

        info!(
            current_version = %inner.options.current_version,
            feed = %inner.feed.url(),
            "Update controller ready"
        );
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        ))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> UpdateLifecycleState {
        self.inner.status.lock().state
    }

    /// Snapshot of the active or last completed download session.
    pub fn download_session(&self) -> Option<DownloadSession> {
        self.inner.status.lock().session.clone()
    }

    pub fn current_version(&self) -> &Version {
        &self.inner.options.current_version
    }

    /// Run an update attempt, or join the one already running.
    pub async fn check_for_updates(&self) -> Result<AttemptOutcome, UpdateError> {
        self.join_or_start()?.await
    }

    fn join_or_start(&self) -> Result<AttemptFuture, UpdateError> {
        let mut slot = self.inner.in_flight.lock();
        if let Some((_, attempt)) = slot.as_ref() {
            debug!("Joining update attempt in flight");
            return Ok(attempt.clone());
        }

        {
            let status = self.inner.status.lock();
            match (status.state, &status.staged) {
                (UpdateLifecycleState::ReadyToInstall, Some(staged)) => {
                    let outcome = AttemptOutcome::ReadyToInstall(staged.summary.clone());
                    return Ok(futures_util::future::ready(Ok(outcome)).boxed().shared());
                }
                (UpdateLifecycleState::Installing, _) => {
                    return Err(UpdateError::InvalidState(
                        "installation in progress".to_string(),
                    ));
                }
                _ => {}
            }
        }

        let id = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run_attempt(id, cancel).await });
        let inner = self.inner.clone();
        let attempt: AttemptFuture = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(inner.recover_aborted_attempt(id, join_error)),
            }
        }
        .boxed()
        .shared();

        *slot = Some((id, attempt.clone()));
        Ok(attempt)
    }

    /// Answer the consent prompt of a non-mandatory update.
    pub fn user_consent(&self, proceed: bool) -> Result<(), UpdateError> {
        let sender = self.inner.consent.lock().take().ok_or_else(|| {
            UpdateError::InvalidState("no update is waiting for consent".to_string())
        })?;
        info!(proceed, "User consent received");
        // The attempt may have been cancelled meanwhile; nothing to do then.
        let _ = sender.send(proceed);
        Ok(())
    }

    /// Install the staged update now.
    pub async fn install_now(&self) -> Result<(), UpdateError> {
        self.inner.install().await
    }

    /// Process-quit hook. Installs a staged update when auto-install-on-quit
    /// is configured. Returns whether an install ran.
    pub async fn on_quit(&self) -> Result<bool, UpdateError> {
        if !self.inner.options.auto_install_on_quit
            || self.state() != UpdateLifecycleState::ReadyToInstall
        {
            return Ok(false);
        }
        info!("Installing staged update on quit");
        self.inner.install().await.map(|_| true)
    }

    /// Cancel the attempt in flight, if any.
    pub fn cancel(&self) {
        info!("Cancelling update attempt");
        self.inner.cancel.lock().cancel();
    }
}

impl Inner {
    fn set_state(&self, next: UpdateLifecycleState) -> Result<(), UpdateError> {
        let mut status = self.status.lock();
        let current = status.state;
        if !current.can_transition_to(next) {
            return Err(UpdateError::InvalidState(format!(
                "cannot move from {:?} to {:?}",
                current, next
            )));
        }
        status.state = next;
        drop(status);
        info!(from = ?current, to = ?next, "Update state changed");
        Ok(())
    }

    async fn run_attempt(
        self: Arc<Self>,
        id: u64,
        cancel: CancellationToken,
    ) -> Result<AttemptOutcome, UpdateError> {
        let result = self.attempt(&cancel).await;

        match &result {
            Ok(outcome) => debug!(?outcome, "Update attempt finished"),
            Err(UpdateError::Cancelled) => {
                info!("Update attempt cancelled");
                self.discard_attempt();
                self.force_idle();
            }
            Err(err) => self.fail(err),
        }

        self.consent.lock().take();
        let mut slot = self.in_flight.lock();
        if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
            *slot = None;
        }
        result
    }

    async fn attempt(&self, cancel: &CancellationToken) -> Result<AttemptOutcome, UpdateError> {
        self.set_state(UpdateLifecycleState::Checking)?;
        self.events.emit(UpdateEvent::CheckingForUpdate);

        let manifest = self.feed.fetch(cancel).await?;
        let current = &self.options.current_version;

        let decision = self.rollout.decide(
            &self.identity,
            manifest.effective_staging(),
            &manifest.version,
        );
        if !decision.admitted {
            info!(
                version = %manifest.version,
                bucket = decision.bucket_value,
                staging_percentage = manifest.effective_staging(),
                "Installation not admitted to staged rollout"
            );
            self.set_state(UpdateLifecycleState::Idle)?;
            self.events.emit(UpdateEvent::UpdateNotAvailable {
                current: current.clone(),
            });
            return Ok(AttemptOutcome::NotAdmitted(decision));
        }

        let transition = self.policy.validate_transition(current, &manifest)?;
        if transition == Transition::UpToDate {
            info!(version = %current, "Already up to date");
            self.set_state(UpdateLifecycleState::Idle)?;
            self.events.emit(UpdateEvent::UpdateNotAvailable {
                current: current.clone(),
            });
            return Ok(AttemptOutcome::UpToDate);
        }

        let mut summary = manifest.summary();
        summary.mandatory = transition.skips_consent();
        self.set_state(UpdateLifecycleState::Available)?;

        if transition.skips_consent() {
            self.events.emit(UpdateEvent::UpdateAvailable(summary.clone()));
            info!(version = %manifest.version, "Mandatory update, skipping consent");
        } else {
            // Register before announcing so an immediate answer is not lost.
            let (tx, rx) = oneshot::channel();
            *self.consent.lock() = Some(tx);
            self.events.emit(UpdateEvent::UpdateAvailable(summary.clone()));

            let proceed = tokio::select! {
                _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                answer = rx => answer.unwrap_or(false),
            };
            if !proceed {
                info!(version = %manifest.version, "Update declined");
                self.set_state(UpdateLifecycleState::Idle)?;
                return Ok(AttemptOutcome::Declined);
            }
        }

        self.set_state(UpdateLifecycleState::Downloading)?;
        let path = self.obtain_artifact(&manifest, cancel).await?;

        {
            let mut status = self.status.lock();
            status.staged = Some(StagedUpdate {
                summary: summary.clone(),
                path,
            });
        }
        self.set_state(UpdateLifecycleState::ReadyToInstall)?;
        self.events.emit(UpdateEvent::UpdateDownloaded(summary.clone()));
        info!(version = %summary.version, "Update ready to install");
        Ok(AttemptOutcome::ReadyToInstall(summary))
    }

    /// Produce a verified, staged artifact. A delta is tried first when the
    /// plan calls for one; any delta failure falls back to the full artifact.
    async fn obtain_artifact(
        &self,
        manifest: &UpdateManifest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, UpdateError> {
        let plan = self
            .planner
            .plan(&self.options.current_version, manifest, cancel)?;

        if let TransferPlan::Differential(delta) = plan {
            let key = delta.cache_key();
            match self.differential(manifest, delta, cancel).await {
                Ok(path) => return Ok(path),
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(err) => {
                    warn!(error = %err, "Differential update failed, falling back to full download");
                    if let Err(e) = self.downloader.cache().discard(&key) {
                        warn!(error = %e, "Failed to discard delta");
                    }
                    if self.status.lock().state == UpdateLifecycleState::Verifying {
                        self.set_state(UpdateLifecycleState::Downloading)?;
                    }
                }
            }
        }

        self.full(manifest, cancel).await
    }

    async fn differential(
        &self,
        manifest: &UpdateManifest,
        mut delta: DeltaDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, UpdateError> {
        let base_source = self
            .base_source
            .clone()
            .ok_or_else(|| DeltaError::BaseUnavailable("no base artifact source".to_string()))?;

        let request = DownloadRequest {
            url: self.feed.resolve(&delta.path)?,
            cache_key: delta.cache_key(),
            expected_size: delta.size,
            size_tolerance_percent: 0,
            resumable: true,
        };
        let downloaded = self
            .downloader
            .execute(&request, cancel, Some(self.progress_callback()))
            .await?;
        self.status.lock().session = Some(downloaded.session.clone());

        delta.load(Bytes::from(tokio::fs::read(&downloaded.path).await?));
        self.downloader.cache().discard(&request.cache_key)?;

        cancel.check()?;
        let base = base_source.load_base(&delta.from_version).await?;
        cancel.check()?;

        self.set_state(UpdateLifecycleState::Verifying)?;
        let planner = self.planner.clone();
        let artifact = tokio::task::spawn_blocking(move || planner.apply_delta(&base, &mut delta))
        .await
        .map_err(|e| UpdateError::Internal(e.to_string()))??;

        let artifact = self
            .verify(artifact, manifest)
            .await
            .map_err(|e| DeltaError::Reconstruction(e.to_string()))?;

        let key = DownloadCache::artifact_key(&manifest.version, &manifest.artifact_path);
        let path = self.downloader.cache().staged_path(&key);
        tokio::fs::write(&path, &artifact).await?;
        info!(version = %manifest.version, "Artifact rebuilt from delta");
        Ok(path)
    }

    async fn full(
        &self,
        manifest: &UpdateManifest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, UpdateError> {
        let request = DownloadRequest {
            url: self.feed.resolve(&manifest.artifact_path)?,
            cache_key: DownloadCache::artifact_key(&manifest.version, &manifest.artifact_path),
            expected_size: manifest.size,
            size_tolerance_percent: self.options.size_tolerance_percent,
            resumable: true,
        };
        let downloaded = self
            .downloader
            .execute(&request, cancel, Some(self.progress_callback()))
            .await?;
        self.status.lock().session = Some(downloaded.session.clone());

        self.set_state(UpdateLifecycleState::Verifying)?;
        let bytes = tokio::fs::read(&downloaded.path).await?;
        self.verify(bytes, manifest).await?;
        Ok(downloaded.path)
    }

    /// Verify on the blocking pool; signature checks over large artifacts
    /// are CPU-bound.
    async fn verify(
        &self,
        artifact: Vec<u8>,
        manifest: &UpdateManifest,
    ) -> Result<Vec<u8>, UpdateError> {
        let integrity = self.integrity.clone();
        let manifest = manifest.clone();
        let tolerance = self.options.size_tolerance_percent;
        tokio::task::spawn_blocking(move || {
            integrity
                .verify_artifact(&artifact, &manifest, tolerance)
                .map(|_| artifact)
        })
        .await
        .map_err(|e| UpdateError::Internal(e.to_string()))?
        .map_err(UpdateError::from)
    }

    fn progress_callback(&self) -> ProgressCallback {
        let status = self.status.clone();
        let events = self.events.clone();
        Arc::new(move |session: &DownloadSession, progress: DownloadProgress| {
            status.lock().session = Some(session.clone());
            events.emit(UpdateEvent::DownloadProgress(progress));
        })
    }

    async fn install(&self) -> Result<(), UpdateError> {
        let staged = {
            let status = self.status.lock();
            match (status.state, &status.staged) {
                (UpdateLifecycleState::ReadyToInstall, Some(staged)) => staged.clone(),
                (state, _) => {
                    return Err(UpdateError::InvalidState(format!(
                        "no update ready to install (state {:?})",
                        state
                    )))
                }
            }
        };
        self.set_state(UpdateLifecycleState::Installing)?;

        info!(version = %staged.summary.version, "Installing update");
        let result = self
            .installer
            .install_and_restart(&staged.path, self.options.silent, self.options.force_restart)
            .await;

        match result {
            Ok(()) => {
                self.discard_attempt();
                self.set_state(UpdateLifecycleState::Idle)?;
                info!(version = %staged.summary.version, "Update installed");
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Report an unrecoverable error and return to `Idle`.
    fn fail(&self, err: &UpdateError) {
        error!(kind = %err.kind(), error = %err, "Update attempt failed");
        self.discard_attempt();
        self.force_idle_via_failed();
        self.events.emit(UpdateEvent::error(err));
    }

    /// Release the single-flight slot of an attempt task that died without
    /// reaching its own cleanup.
    fn recover_aborted_attempt(&self, id: u64, join_error: JoinError) -> UpdateError {
        let err = UpdateError::Internal(format!("update attempt aborted: {}", join_error));
        self.consent.lock().take();
        {
            let mut slot = self.in_flight.lock();
            if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
                *slot = None;
            }
        }
        self.fail(&err);
        err
    }

    fn force_idle_via_failed(&self) {
        {
            let mut status = self.status.lock();
            status.state = UpdateLifecycleState::Failed;
        }
        info!(to = ?UpdateLifecycleState::Failed, "Update state changed");
        self.force_idle();
    }

    fn force_idle(&self) {
        self.status.lock().state = UpdateLifecycleState::Idle;
        info!(to = ?UpdateLifecycleState::Idle, "Update state changed");
    }

    /// Drop staged and partial bytes of the attempt.
    fn discard_attempt(&self) {
        {
            let mut status = self.status.lock();
            status.staged = None;
        }
        if let Err(e) = self.downloader.cache().clear() {
            warn!(error = %e, "Failed to clear download cache");
        }
    }
}
