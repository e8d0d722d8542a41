//! On-disk download cache.
//!
//! Each transfer is keyed by `(fromVersion, toVersion)` for deltas or by
//! version and artifact name for full downloads. A key owns three files:
//!
//! - `<key>.part`: bytes received so far
//! - `<key>.downloading`: marker present while a transfer is in progress
//! - `<key>`: completed transfer, not yet verified
//!
//! The cache owns a dedicated `update-engine` directory under the configured
//! cache dir and never touches anything outside it. Nothing in the cache is
//! trusted across process restarts.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use semver::Version;
use tracing::{debug, info, warn};

use crate::error::UpdateError;

const PARTIAL_SUFFIX: &str = "part";
const MARKER_SUFFIX: &str = "downloading";

/// Subdirectory of the configured cache dir that holds all transfers.
pub const CACHE_SUBDIR: &str = "update-engine";

/// Directory-backed cache of in-flight and completed transfers.
#[derive(Debug, Clone)]
pub struct DownloadCache {
    root: PathBuf,
}

impl DownloadCache {
    /// Cache rooted at `<cache_dir>/update-engine`.
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            root: cache_dir.as_ref().join(CACHE_SUBDIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache key for a full artifact download.
    pub fn artifact_key(version: &Version, artifact_path: &str) -> String {
        let name = artifact_path
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("artifact");
        let name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{}", version, name)
    }

    pub fn partial_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, PARTIAL_SUFFIX))
    }

    pub fn marker_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, MARKER_SUFFIX))
    }

    pub fn staged_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Start or resume a transfer. Returns the number of bytes already on
    /// disk for `key`.
    pub fn begin(&self, key: &str) -> Result<u64, UpdateError> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.marker_path(key), b"")?;
        Ok(self.partial_len(key))
    }

    /// Bytes already received for `key`.
    pub fn partial_len(&self, key: &str) -> u64 {
        std::fs::metadata(self.partial_path(key))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Drop the partial file so the next attempt starts from zero.
    pub fn reset_partial(&self, key: &str) -> Result<(), UpdateError> {
        remove_if_exists(&self.partial_path(key))
    }

    /// Promote the partial file to a completed transfer.
    pub fn finish(&self, key: &str) -> Result<PathBuf, UpdateError> {
        let staged = self.staged_path(key);
        std::fs::rename(self.partial_path(key), &staged)?;
        remove_if_exists(&self.marker_path(key))?;
        debug!(key, "Transfer staged");
        Ok(staged)
    }

    /// Remove every file belonging to `key`.
    pub fn discard(&self, key: &str) -> Result<(), UpdateError> {
        remove_if_exists(&self.partial_path(key))?;
        remove_if_exists(&self.marker_path(key))?;
        remove_if_exists(&self.staged_path(key))?;
        debug!(key, "Cache entry discarded");
        Ok(())
    }

    /// Remove every transfer left behind by an earlier process. Returns how
    /// many files were deleted.
    pub fn purge_stale(&self) -> Result<usize, UpdateError> {
        let removed = self.remove_all()?;
        if removed > 0 {
            info!(removed, root = %self.root.display(), "Purged stale download cache");
        }
        Ok(removed)
    }

    /// Remove all cache entries at the end of an attempt.
    pub fn clear(&self) -> Result<(), UpdateError> {
        self.remove_all().map(|_| ())
    }

    fn remove_all(&self) -> Result<usize, UpdateError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            // Only plain files are ours; directories and links are left alone.
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                debug!(path = %entry.path().display(), "Skipping foreign cache entry");
                continue;
            }
            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cache entry"),
            }
        }
        Ok(removed)
    }
}

fn remove_if_exists(path: &Path) -> Result<(), UpdateError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
