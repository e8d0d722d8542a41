//! Error types for the update engine.
//!
//! Errors are grouped by how the engine reacts to them:
//! - [`NetworkError`]: retried locally with backoff
//! - [`DeltaError`]: recovered locally by falling back to a full transfer
//! - [`IntegrityError`], [`PolicyError`], [`ManifestError`]: fatal for the
//!   attempt, surfaced to the UI and never retried

use std::fmt;

use thiserror::Error;

/// Transport-level failures. Retryable unless the server gave a definitive
/// client-error answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// An operation exceeded its timeout
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// Connection could not be established or was reset
    #[error("connection error: {0}")]
    Connection(String),

    /// Server answered with a non-success HTTP status
    #[error("server returned status {status}")]
    Status { status: u16 },

    /// Body stream ended before the expected number of bytes arrived
    #[error("transfer interrupted after {received} of {expected} bytes")]
    Interrupted { received: u64, expected: u64 },
}

impl NetworkError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Status { status } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => true,
        }
    }
}

/// Hash, signature, certificate, pinning and size failures.
///
/// Never retried: the bytes behind an integrity failure are deleted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    /// A manifest field is missing or has the wrong shape
    #[error("manifest field `{field}` is invalid: {reason}")]
    InvalidManifestField { field: &'static str, reason: String },

    /// Declared artifact size is outside the accepted range
    #[error("suspicious artifact size: {size} bytes")]
    SuspiciousSize { size: u64 },

    /// Artifact size does not match the manifest
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Content hash does not match the manifest
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Not enough pinned keys signed the manifest envelope
    #[error("insufficient manifest signatures: required {required}, found {found}")]
    InsufficientSignatures { required: usize, found: usize },

    /// Artifact signature does not verify under the signer's key
    #[error("artifact signature invalid: {0}")]
    SignatureInvalid(String),

    /// Signer is not one of the trusted publishers
    #[error("untrusted publisher `{common_name}` (fingerprint {fingerprint})")]
    UntrustedPublisher {
        common_name: String,
        fingerprint: String,
    },

    /// A certificate's declared fingerprint does not match its public key
    #[error("certificate `{subject}` fingerprint does not match its public key")]
    ForgedFingerprint { subject: String },

    /// Certificate chain is structurally broken
    #[error("broken certificate chain: {0}")]
    BrokenChain(String),

    /// Chain terminates at a root that is not trusted
    #[error("untrusted root certificate {fingerprint}")]
    UntrustedRoot { fingerprint: String },

    /// Certificate is outside its validity window
    #[error("certificate `{subject}` is not valid at this time")]
    CertificateExpired { subject: String },

    /// Host presented a certificate that does not match its pin
    #[error("certificate pin mismatch for host {host}")]
    PinMismatch { host: String },
}

/// Corrupt or inapplicable delta. Triggers a fallback to the full artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    /// Header magic or framing is wrong
    #[error("bad delta header: {0}")]
    BadHeader(String),

    /// Delta format version is not understood
    #[error("unsupported delta format {0}")]
    UnsupportedFormat(u8),

    /// Delta bytes do not hash to the advertised value
    #[error("delta hash mismatch")]
    HashMismatch,

    /// Delta was produced against a different base artifact
    #[error("delta does not apply to this base artifact")]
    BaseMismatch,

    /// Delta operations reference bytes outside the base or run past the end
    #[error("delta operation out of bounds at offset {0}")]
    OutOfBounds(usize),

    /// Reconstructed output has the wrong length
    #[error("delta output length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// Delta is not smaller than the full artifact
    #[error("delta ({delta} bytes) is not smaller than full artifact ({full} bytes)")]
    NotSmaller { delta: u64, full: u64 },

    /// Delta buffer was already consumed or never downloaded
    #[error("delta buffer is not loaded")]
    MissingBuffer,

    /// The installed base artifact could not be read
    #[error("base artifact unavailable: {0}")]
    BaseUnavailable(String),

    /// Reconstructed artifact failed verification
    #[error("reconstructed artifact failed verification: {0}")]
    Reconstruction(String),
}

/// Version-ordering policy violation. Fatal and never silently corrected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// Candidate version is lower than the running version
    #[error("downgrade rejected: {current} -> {candidate}")]
    Downgrade { current: String, candidate: String },

    /// Manifest demands a minimum above the version it ships
    #[error("minimum version {minimum} is above release version {release}")]
    MinimumAboveRelease { minimum: String, release: String },
}

/// Malformed or stale manifest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    /// Manifest or envelope could not be parsed
    #[error("malformed manifest: {0}")]
    Malformed(String),

    /// Envelope timestamp is older than the accepted age
    #[error("manifest timestamp is too old")]
    TooOld,

    /// Envelope timestamp is in the future
    #[error("manifest timestamp is in the future")]
    FromFuture,

    /// Feed or artifact URL violates the transport policy
    #[error("rejected URL {url}: {reason}")]
    RejectedUrl { url: String, reason: String },
}

/// Coarse error class reported to external collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Integrity,
    Delta,
    Policy,
    Manifest,
    Cancelled,
    Config,
    Io,
    Installer,
    Internal,
}

impl ErrorKind {
    /// Stable identifier used in `error` events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Delta => "delta",
            ErrorKind::Policy => "policy",
            ErrorKind::Manifest => "manifest",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Installer => "installer",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during an update attempt.
///
/// `Clone` so a single in-flight result can be handed to every caller that
/// joined the attempt.
#[derive(Debug, Clone, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Attempt was cancelled through its cancellation token
    #[error("update attempt cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Installer invocation failed
    #[error("installation failed: {0}")]
    Installer(String),

    /// Operation not allowed in the current lifecycle state
    #[error("invalid lifecycle state: {0}")]
    InvalidState(String),

    /// Background attempt task died
    #[error("internal error: {0}")]
    Internal(String),
}

impl UpdateError {
    /// Error class for event reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Network(_) => ErrorKind::Network,
            UpdateError::Integrity(_) => ErrorKind::Integrity,
            UpdateError::Delta(_) => ErrorKind::Delta,
            UpdateError::Policy(_) => ErrorKind::Policy,
            UpdateError::Manifest(_) => ErrorKind::Manifest,
            UpdateError::Cancelled => ErrorKind::Cancelled,
            UpdateError::Config(_) => ErrorKind::Config,
            UpdateError::Io(_) => ErrorKind::Io,
            UpdateError::Installer(_) => ErrorKind::Installer,
            UpdateError::InvalidState(_) | UpdateError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only transport failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpdateError::Network(e) if e.is_retryable())
    }
}

impl From<std::io::Error> for UpdateError {
    fn from(err: std::io::Error) -> Self {
        UpdateError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ManifestError {
    fn from(err: serde_json::Error) -> Self {
        ManifestError::Malformed(err.to_string())
    }
}

impl From<serde_json::Error> for UpdateError {
    fn from(err: serde_json::Error) -> Self {
        UpdateError::Manifest(err.into())
    }
}

impl From<url::ParseError> for ManifestError {
    fn from(err: url::ParseError) -> Self {
        ManifestError::Malformed(format!("invalid URL: {}", err))
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout {
                operation: "HTTP request",
            }
        } else if let Some(status) = err.status() {
            NetworkError::Status {
                status: status.as_u16(),
            }
        } else {
            NetworkError::Connection(err.to_string())
        }
    }
}

impl From<ed25519_dalek::SignatureError> for IntegrityError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        IntegrityError::SignatureInvalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_retryable() {
        assert!(NetworkError::Timeout { operation: "chunk" }.is_retryable());
        assert!(NetworkError::Connection("reset".into()).is_retryable());
        assert!(NetworkError::Status { status: 503 }.is_retryable());
        assert!(NetworkError::Status { status: 429 }.is_retryable());
        assert!(!NetworkError::Status { status: 404 }.is_retryable());
    }

    #[test]
    fn test_only_network_errors_are_retryable() {
        let timeout: UpdateError = NetworkError::Timeout { operation: "x" }.into();
        assert!(timeout.is_retryable());

        let integrity: UpdateError = IntegrityError::HashMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(!integrity.is_retryable());

        let delta: UpdateError = DeltaError::HashMismatch.into();
        assert!(!delta.is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        let err: UpdateError = PolicyError::Downgrade {
            current: "2.0.0".into(),
            candidate: "1.9.9".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Policy);
        assert_eq!(err.kind().as_str(), "policy");

        let err: UpdateError = ManifestError::TooOld.into();
        assert_eq!(err.kind(), ErrorKind::Manifest);

        let err: UpdateError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
