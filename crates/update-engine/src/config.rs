//! Configuration structures for the update engine.
//!
//! Loaded from TOML. Every section has defaults so a minimal file only needs
//! the feed URL, its allowed hosts and the release keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::download::BackoffPolicy;
use crate::error::UpdateError;
use crate::trust::{PinStore, TrustedPublisher};

/// Main engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Manifest feed
    #[serde(default)]
    pub feed: FeedConfig,

    /// Signature, certificate and pinning configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Timeouts and retry policy
    #[serde(default)]
    pub network: NetworkConfig,

    /// Installer behavior
    #[serde(default)]
    pub install: InstallConfig,

    /// Download cache directory (empty = default location)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Installation identity file (empty = default location)
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that would weaken verification.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.security.signature_threshold == 0 {
            return Err(UpdateError::Config(
                "security.signature_threshold must be at least 1".to_string(),
            ));
        }
        if self.security.size_tolerance_percent > 100 {
            return Err(UpdateError::Config(
                "security.size_tolerance_percent must be at most 100".to_string(),
            ));
        }
        if self.network.chunk_timeout_secs == 0 || self.feed.fetch_timeout_secs == 0 {
            return Err(UpdateError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("cache"))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.identity_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("installation-id"))
    }
}

/// Manifest feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// HTTPS URL of the signed manifest
    #[serde(default)]
    pub url: String,

    /// Hosts the feed and artifacts may be served from
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Manifest fetch timeout in seconds
    #[serde(default = "default_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            allowed_hosts: Vec::new(),
            fetch_timeout_secs: default_timeout(),
        }
    }
}

impl FeedConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Security configuration for update verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Pinned public keys for manifest signing (Ed25519, hex encoded)
    /// Format: "ed25519:<hex_public_key>"
    #[serde(default)]
    pub manifest_keys: Vec<String>,

    /// Minimum number of valid signatures required
    #[serde(default = "default_signature_threshold")]
    pub signature_threshold: usize,

    /// Oldest manifest envelope accepted, in hours
    #[serde(default = "default_max_manifest_age")]
    pub max_manifest_age_hours: u32,

    /// Publishers allowed to sign artifacts
    #[serde(default)]
    pub trusted_publishers: Vec<TrustedPublisher>,

    /// Root certificate fingerprints (empty = any self-signed root)
    #[serde(default)]
    pub trusted_roots: Vec<String>,

    /// Certificate pins per host
    #[serde(default)]
    pub pins: BTreeMap<String, Vec<String>>,

    /// Accepted deviation of the artifact size from the manifest, in percent
    #[serde(default)]
    pub size_tolerance_percent: u8,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            manifest_keys: Vec::new(),
            signature_threshold: default_signature_threshold(),
            max_manifest_age_hours: default_max_manifest_age(),
            trusted_publishers: Vec::new(),
            trusted_roots: Vec::new(),
            pins: BTreeMap::new(),
            size_tolerance_percent: 0,
        }
    }
}

impl SecurityConfig {
    /// Parse manifest keys into Ed25519 verifying keys.
    pub fn parse_manifest_keys(&self) -> Result<Vec<ed25519_dalek::VerifyingKey>, UpdateError> {
        self.manifest_keys
            .iter()
            .map(|key| parse_ed25519_key(key))
            .collect()
    }

    pub fn pin_store(&self) -> PinStore {
        PinStore::from_map(self.pins.clone())
    }

    pub fn max_manifest_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_manifest_age_hours as i64)
    }
}

/// Parse an Ed25519 public key of the form "ed25519:<hex_encoded_32_bytes>".
fn parse_ed25519_key(s: &str) -> Result<ed25519_dalek::VerifyingKey, UpdateError> {
    let hex_str = s
        .strip_prefix("ed25519:")
        .ok_or_else(|| UpdateError::Config("key must start with 'ed25519:'".to_string()))?;

    let key_data = hex::decode(hex_str)
        .map_err(|e| UpdateError::Config(format!("invalid key encoding: {}", e)))?;

    let key_bytes: [u8; 32] = key_data.try_into().map_err(|_| {
        UpdateError::Config("Ed25519 public key must be 32 bytes".to_string())
    })?;

    ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| UpdateError::Config(format!("invalid Ed25519 public key: {}", e)))
}

/// Network configuration for transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Timeout for connecting and for each body chunk, in seconds
    #[serde(default = "default_timeout")]
    pub chunk_timeout_secs: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Retry delay cap in milliseconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Randomize retry delays
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            chunk_timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            jitter: true,
        }
    }
}

impl NetworkConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Installer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Install a ready update when the application quits
    #[serde(default)]
    pub auto_install_on_quit: bool,

    /// Ask the installer for a silent install
    #[serde(default)]
    pub silent: bool,

    /// Ask the installer to relaunch the application
    #[serde(default = "default_true")]
    pub force_restart: bool,

    /// Installer command line, program first
    #[serde(default)]
    pub command: Vec<String>,

    /// Installed artifact that deltas are applied to (empty = full downloads only)
    #[serde(default)]
    pub base_artifact: Option<PathBuf>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            auto_install_on_quit: false,
            silent: false,
            force_restart: true,
            command: Vec::new(),
            base_artifact: None,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_signature_threshold() -> usize {
    1
}

fn default_max_manifest_age() -> u32 {
    7 * 24
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    30_000
}

/// Get the default data directory.
fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join("UpdateEngine");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("UpdateEngine");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(data_home).join("update-engine");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("update-engine");
        }
    }

    // Fallback
    PathBuf::from(".").join("update-engine")
}
