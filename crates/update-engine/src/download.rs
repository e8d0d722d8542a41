//! Resumable, retried artifact transfers.
//!
//! A transfer streams into the download cache chunk by chunk. Retryable
//! network failures back off exponentially and resume from the bytes already
//! on disk. Any terminal failure removes every file the transfer created.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::DownloadCache;
use crate::cancel::CancellationToken;
use crate::error::{IntegrityError, NetworkError, UpdateError};
use crate::integrity::IntegrityVerifier;
use crate::transport::{TransferRequest, Transport};

const RANGE_NOT_SATISFIABLE: u16 = 416;

/// Progress callback, invoked after every chunk.
pub type ProgressCallback = Arc<dyn Fn(&DownloadSession, DownloadProgress) + Send + Sync>;

/// Exponential backoff: `base * 2^retry`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (zero-based), without jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Randomizes a backoff delay.
pub trait Jitter: Send + Sync {
    fn apply(&self, delay: Duration) -> Duration;
}

/// Uniform jitter in `[delay / 2, delay]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandJitter;

impl Jitter for RandJitter {
    fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms < 2 {
            return delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
    }
}

/// Leaves delays untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn apply(&self, delay: Duration) -> Duration {
        delay
    }
}

/// Lifecycle of one download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Transferring,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

/// State of one transfer across all of its attempts.
///
/// `bytes_transferred <= total_bytes` holds at every observable point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSession {
    pub source_url: Url,
    bytes_transferred: u64,
    total_bytes: u64,
    pub resumable: bool,
    /// 1-based number of the current attempt
    pub attempt: u32,
    pub state: SessionState,
}

impl DownloadSession {
    pub fn new(source_url: Url, total_bytes: u64, resumable: bool) -> Self {
        Self {
            source_url,
            bytes_transferred: 0,
            total_bytes,
            resumable,
            attempt: 0,
            state: SessionState::Pending,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Set the byte position, growing `total_bytes` if needed.
    fn set_transferred(&mut self, bytes: u64) {
        self.bytes_transferred = bytes;
        if bytes > self.total_bytes {
            self.total_bytes = bytes;
        }
    }
}

/// Transfer metrics reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub bytes_per_second: f64,
    /// 0.0 to 100.0
    pub percent: f64,
    pub transferred: u64,
    pub total: u64,
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} bytes ({:.1}%, {:.0} B/s)",
            self.transferred, self.total, self.percent, self.bytes_per_second
        )
    }
}

/// A transfer to run.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: Url,
    pub cache_key: String,
    pub expected_size: u64,
    pub size_tolerance_percent: u8,
    pub resumable: bool,
}

impl DownloadRequest {
    fn allowance(&self) -> u64 {
        self.expected_size
            .saturating_mul(self.size_tolerance_percent as u64)
            / 100
    }

    fn max_size(&self) -> u64 {
        self.expected_size.saturating_add(self.allowance())
    }

    fn min_size(&self) -> u64 {
        self.expected_size.saturating_sub(self.allowance())
    }
}

/// A completed, not yet verified transfer.
#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub session: DownloadSession,
}

/// Keeps reported progress monotonic within a session.
struct ProgressTracker {
    callback: Option<ProgressCallback>,
    high_water: u64,
    attempt_started: Instant,
    attempt_offset: u64,
}

impl ProgressTracker {
    fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            high_water: 0,
            attempt_started: Instant::now(),
            attempt_offset: 0,
        }
    }

    fn start_attempt(&mut self, offset: u64) {
        self.attempt_started = Instant::now();
        self.attempt_offset = offset;
    }

    fn report(&mut self, session: &DownloadSession) {
        let transferred = session.bytes_transferred();
        if transferred < self.high_water {
            return;
        }
        self.high_water = transferred;

        let Some(callback) = &self.callback else {
            return;
        };
        let elapsed = self.attempt_started.elapsed().as_secs_f64();
        let fresh = transferred.saturating_sub(self.attempt_offset) as f64;
        let total = session.total_bytes();
        let progress = DownloadProgress {
            bytes_per_second: if elapsed > 0.0 { fresh / elapsed } else { 0.0 },
            percent: if total == 0 {
                0.0
            } else {
                transferred as f64 / total as f64 * 100.0
            },
            transferred,
            total,
        };
        callback(session, progress);
    }
}

/// Runs transfers against a [`Transport`] into a [`DownloadCache`].
pub struct DownloadCoordinator {
    transport: Arc<dyn Transport>,
    integrity: Arc<IntegrityVerifier>,
    cache: DownloadCache,
    backoff: BackoffPolicy,
    jitter: Arc<dyn Jitter>,
    chunk_timeout: Duration,
}

impl DownloadCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        integrity: Arc<IntegrityVerifier>,
        cache: DownloadCache,
        backoff: BackoffPolicy,
        jitter: Arc<dyn Jitter>,
        chunk_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            integrity,
            cache,
            backoff,
            jitter,
            chunk_timeout,
        }
    }

    pub fn cache(&self) -> &DownloadCache {
        &self.cache
    }

    /// Run `request` to completion, retrying retryable failures.
    pub async fn execute(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        on_progress: Option<ProgressCallback>,
    ) -> Result<DownloadedArtifact, UpdateError> {
        let mut session =
            DownloadSession::new(request.url.clone(), request.expected_size, request.resumable);
        let mut tracker = ProgressTracker::new(on_progress);

        let result = self
            .run(request, cancel, &mut session, &mut tracker)
            .await;

        match result {
            Ok(path) => {
                session.state = SessionState::Completed;
                info!(
                    url = %request.url,
                    bytes = session.bytes_transferred(),
                    attempt = session.attempt,
                    "Download complete"
                );
                Ok(DownloadedArtifact {
                    path,
                    size: session.bytes_transferred(),
                    session,
                })
            }
            Err(err) => {
                session.state = if matches!(err, UpdateError::Cancelled) {
                    SessionState::Cancelled
                } else {
                    SessionState::Failed
                };
                error!(
                    url = %request.url,
                    attempt = session.attempt,
                    error = %err,
                    "Download failed"
                );
                if let Err(cleanup) = self.cache.discard(&request.cache_key) {
                    warn!(error = %cleanup, "Failed to clean up after download failure");
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        session: &mut DownloadSession,
        tracker: &mut ProgressTracker,
    ) -> Result<PathBuf, UpdateError> {
        let mut offset = self.cache.begin(&request.cache_key)?;
        if !request.resumable || offset > request.max_size() {
            self.cache.reset_partial(&request.cache_key)?;
            offset = 0;
        }
        session.set_transferred(offset);
        let mut known_total = None;

        loop {
            cancel.check()?;

            // Every byte already arrived; a ranged request past the end would
            // only earn a 416.
            let on_disk = session.bytes_transferred();
            if session.resumable
                && on_disk > 0
                && on_disk == known_total.unwrap_or(request.expected_size)
            {
                debug!(bytes = on_disk, "Partial transfer already complete");
                return self.cache.finish(&request.cache_key);
            }

            session.attempt += 1;
            session.state = SessionState::Transferring;
            tracker.start_attempt(on_disk);

            match self
                .attempt(request, cancel, session, tracker, &mut known_total)
                .await
            {
                Ok(()) => return self.cache.finish(&request.cache_key),
                Err(UpdateError::Network(NetworkError::Status { status }))
                    if status == RANGE_NOT_SATISFIABLE
                        && session.bytes_transferred() > 0
                        && session.attempt <= self.backoff.max_retries =>
                {
                    warn!(
                        attempt = session.attempt,
                        offset = session.bytes_transferred(),
                        "Server rejected resume offset, restarting from zero"
                    );
                    session.state = SessionState::Retrying;
                    self.cache.reset_partial(&request.cache_key)?;
                    session.set_transferred(0);
                    known_total = None;
                }
                Err(err) if err.is_retryable() && session.attempt <= self.backoff.max_retries => {
                    session.state = SessionState::Retrying;
                    if session.resumable {
                        session.set_transferred(self.cache.partial_len(&request.cache_key));
                    } else {
                        self.cache.reset_partial(&request.cache_key)?;
                        session.set_transferred(0);
                    }

                    let delay = self
                        .jitter
                        .apply(self.backoff.delay(session.attempt - 1));
                    warn!(
                        attempt = session.attempt,
                        resume_from = session.bytes_transferred(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Download attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        session: &mut DownloadSession,
        tracker: &mut ProgressTracker,
        known_total: &mut Option<u64>,
    ) -> Result<(), UpdateError> {
        let transfer = TransferRequest {
            url: request.url.clone(),
            offset: session.bytes_transferred(),
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            r = tokio::time::timeout(self.chunk_timeout, self.transport.open(&transfer)) => {
                r.map_err(|_| NetworkError::Timeout { operation: "connect" })??
            }
        };

        let host = request.url.host_str().unwrap_or_default();
        self.integrity
            .verify_pinning(host, response.peer_fingerprint.as_deref())?;

        *known_total = response.total;
        if let Some(total) = response.total {
            if total > request.max_size() {
                return Err(IntegrityError::SizeMismatch {
                    expected: request.expected_size,
                    actual: total,
                }
                .into());
            }
        }

        let path = self.cache.partial_path(&request.cache_key);
        let mut file = if response.offset == 0 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await?
        } else {
            OpenOptions::new().append(true).open(&path).await?
        };
        session.set_transferred(response.offset);
        tracker.report(session);

        let mut body = response.body;
        loop {
            cancel.check()?;
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                r = tokio::time::timeout(self.chunk_timeout, body.next()) => {
                    r.map_err(|_| NetworkError::Timeout { operation: "chunk" })?
                }
            };
            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };

            let received = session.bytes_transferred() + chunk.len() as u64;
            if received > request.max_size() {
                return Err(IntegrityError::SizeMismatch {
                    expected: request.expected_size,
                    actual: received,
                }
                .into());
            }

            file.write_all(&chunk).await?;
            session.set_transferred(received);
            tracker.report(session);
        }

        file.flush().await?;
        file.sync_all().await?;

        let received = session.bytes_transferred();
        let complete = match response.total {
            Some(total) => received == total,
            None => received >= request.min_size(),
        };
        if !complete {
            return Err(NetworkError::Interrupted {
                received,
                expected: response.total.unwrap_or(request.expected_size),
            }
            .into());
        }

        debug!(bytes = received, "Transfer attempt finished");
        Ok(())
    }
}
