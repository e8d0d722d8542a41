//! Differential transfer planning and the delta patch format.
//!
//! # Wire format
//!
//! ```text
//! magic        8 bytes   "UPDDELTA"
//! format       u8        1
//! base_len     u64 BE
//! target_len   u64 BE
//! base_hash    64 bytes  SHA-512 of the base artifact
//! ops...
//!   0x01 COPY    offset: u64 BE, len: u64 BE   (bytes from the base)
//!   0x02 INSERT  len: u32 BE, bytes            (literal bytes)
//!   0x00 END
//! ```
//!
//! A delta is checked against its advertised hash, then its header, then the
//! base it claims to patch, before any output is produced. The base is only
//! ever borrowed.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use semver::Version;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{DeltaError, UpdateError};
use crate::integrity::{IntegrityVerifier, MAX_ARTIFACT_SIZE};
use crate::manifest::{DeltaEntry, UpdateManifest};

pub const DELTA_MAGIC: &[u8; 8] = b"UPDDELTA";
pub const DELTA_FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = 8 + 1 + 8 + 8 + 64;

const OP_END: u8 = 0x00;
const OP_COPY: u8 = 0x01;
const OP_INSERT: u8 = 0x02;

/// A differential patch from `from_version` to `to_version`.
///
/// Owns the downloaded patch bytes until [`DeltaUpdatePlanner::apply_delta`]
/// consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaDescriptor {
    pub from_version: Version,
    pub to_version: Version,
    /// Advertised patch size; strictly less than the full artifact
    pub size: u64,
    pub content_hash: String,
    /// Location of the patch, relative to the feed
    pub path: String,
    buffer: Option<Bytes>,
}

impl DeltaDescriptor {
    pub fn from_entry(entry: &DeltaEntry, to_version: &Version) -> Self {
        Self {
            from_version: entry.from_version.clone(),
            to_version: to_version.clone(),
            size: entry.size,
            content_hash: entry.content_hash.clone(),
            path: entry.path.clone(),
            buffer: None,
        }
    }

    /// Attach downloaded patch bytes.
    pub fn load(&mut self, bytes: Bytes) {
        self.buffer = Some(bytes);
    }

    pub fn is_loaded(&self) -> bool {
        self.buffer.is_some()
    }

    /// Drop the patch bytes.
    pub fn release(&mut self) {
        self.buffer = None;
    }

    /// Cache key for this patch.
    pub fn cache_key(&self) -> String {
        format!("{}-{}.delta", self.from_version, self.to_version)
    }
}

/// How the artifact for an attempt will be obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPlan {
    Differential(DeltaDescriptor),
    Full { artifact_path: String },
}

impl TransferPlan {
    pub fn is_differential(&self) -> bool {
        matches!(self, TransferPlan::Differential(_))
    }
}

/// Supplies the installed artifact that deltas are applied to.
#[async_trait]
pub trait BaseArtifactSource: Send + Sync {
    async fn load_base(&self, version: &Version) -> Result<Bytes, DeltaError>;
}

/// Reads the installed artifact from a fixed path.
#[derive(Debug, Clone)]
pub struct FileBaseSource {
    path: PathBuf,
}

impl FileBaseSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BaseArtifactSource for FileBaseSource {
    async fn load_base(&self, version: &Version) -> Result<Bytes, DeltaError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            DeltaError::BaseUnavailable(format!("{} ({}): {}", self.path.display(), version, e))
        })?;
        Ok(Bytes::from(bytes))
    }
}

/// Parsed delta header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeltaHeader {
    base_len: u64,
    target_len: u64,
    base_hash: [u8; 64],
}

impl DeltaHeader {
    fn read(buf: &mut &[u8]) -> Result<Self, DeltaError> {
        if buf.remaining() < HEADER_LEN {
            return Err(DeltaError::BadHeader("truncated header".to_string()));
        }
        if &buf[..DELTA_MAGIC.len()] != DELTA_MAGIC {
            return Err(DeltaError::BadHeader("bad magic".to_string()));
        }
        buf.advance(DELTA_MAGIC.len());

        let format = buf.get_u8();
        if format != DELTA_FORMAT_VERSION {
            return Err(DeltaError::UnsupportedFormat(format));
        }

        let base_len = buf.get_u64();
        let target_len = buf.get_u64();
        if target_len > MAX_ARTIFACT_SIZE {
            return Err(DeltaError::BadHeader(format!(
                "target length {} exceeds limit",
                target_len
            )));
        }

        let mut base_hash = [0u8; 64];
        buf.copy_to_slice(&mut base_hash);

        Ok(Self {
            base_len,
            target_len,
            base_hash,
        })
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_slice(DELTA_MAGIC);
        out.put_u8(DELTA_FORMAT_VERSION);
        out.put_u64(self.base_len);
        out.put_u64(self.target_len);
        out.put_slice(&self.base_hash);
    }
}

/// Chooses between differential and full transfer and applies deltas.
pub struct DeltaUpdatePlanner {
    integrity: Arc<IntegrityVerifier>,
}

impl DeltaUpdatePlanner {
    pub fn new(integrity: Arc<IntegrityVerifier>) -> Self {
        Self { integrity }
    }

    /// Prefer a delta from `current` when the manifest advertises one that
    /// is smaller than the full artifact; otherwise transfer in full.
    pub fn plan(
        &self,
        current: &Version,
        manifest: &UpdateManifest,
        cancel: &CancellationToken,
    ) -> Result<TransferPlan, UpdateError> {
        cancel.check()?;
        let full = TransferPlan::Full {
            artifact_path: manifest.artifact_path.clone(),
        };

        let Some(entry) = manifest.delta_from(current) else {
            debug!(current = %current, "No delta advertised, planning full transfer");
            return Ok(full);
        };

        cancel.check()?;
        if entry.size >= manifest.size {
            let err = DeltaError::NotSmaller {
                delta: entry.size,
                full: manifest.size,
            };
            warn!(error = %err, "Ignoring delta");
            return Ok(full);
        }

        info!(
            from = %entry.from_version,
            to = %manifest.version,
            delta_size = entry.size,
            full_size = manifest.size,
            "Planning differential transfer"
        );
        Ok(TransferPlan::Differential(DeltaDescriptor::from_entry(
            entry,
            &manifest.version,
        )))
    }

    /// Encode `target` as a patch against `base`.
    ///
    /// Emits the common prefix and suffix as copies and the differing middle
    /// as literal inserts.
    pub fn generate_delta(base: &[u8], target: &[u8]) -> Bytes {
        let prefix = base
            .iter()
            .zip(target.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = base.len().min(target.len()) - prefix;
        let suffix = base
            .iter()
            .rev()
            .zip(target.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let middle = &target[prefix..target.len() - suffix];
        let mut out = BytesMut::with_capacity(HEADER_LEN + middle.len() + 64);

        let mut base_hash = [0u8; 64];
        base_hash.copy_from_slice(&Sha512::digest(base));
        DeltaHeader {
            base_len: base.len() as u64,
            target_len: target.len() as u64,
            base_hash,
        }
        .write(&mut out);

        if prefix > 0 {
            out.put_u8(OP_COPY);
            out.put_u64(0);
            out.put_u64(prefix as u64);
        }
        for chunk in middle.chunks(u32::MAX as usize) {
            out.put_u8(OP_INSERT);
            out.put_u32(chunk.len() as u32);
            out.put_slice(chunk);
        }
        if suffix > 0 {
            out.put_u8(OP_COPY);
            out.put_u64((base.len() - suffix) as u64);
            out.put_u64(suffix as u64);
        }
        out.put_u8(OP_END);

        out.freeze()
    }

    /// Rebuild the target artifact from `base` and the loaded patch.
    ///
    /// The patch buffer is released whether or not the apply succeeds.
    pub fn apply_delta(
        &self,
        base: &[u8],
        delta: &mut DeltaDescriptor,
    ) -> Result<Vec<u8>, DeltaError> {
        let buffer = delta.buffer.take().ok_or(DeltaError::MissingBuffer)?;

        if buffer.len() as u64 != delta.size {
            return Err(DeltaError::LengthMismatch {
                expected: delta.size,
                actual: buffer.len() as u64,
            });
        }
        self.integrity
            .verify_content_hash(&buffer, &delta.content_hash)
            .map_err(|_| DeltaError::HashMismatch)?;

        let mut cursor: &[u8] = &buffer;
        let header = DeltaHeader::read(&mut cursor)?;

        let base_hash = Sha512::digest(base);
        if header.base_len != base.len() as u64
            || base_hash.as_slice().ct_eq(&header.base_hash).unwrap_u8() != 1
        {
            return Err(DeltaError::BaseMismatch);
        }

        let target_len = header.target_len as usize;
        let mut out = Vec::with_capacity(target_len);

        loop {
            let pos = buffer.len() - cursor.remaining();
            if !cursor.has_remaining() {
                return Err(DeltaError::BadHeader("missing end marker".to_string()));
            }
            match cursor.get_u8() {
                OP_END => break,
                OP_COPY => {
                    if cursor.remaining() < 16 {
                        return Err(DeltaError::OutOfBounds(pos));
                    }
                    let offset = usize::try_from(cursor.get_u64())
                        .map_err(|_| DeltaError::OutOfBounds(pos))?;
                    let len = usize::try_from(cursor.get_u64())
                        .map_err(|_| DeltaError::OutOfBounds(pos))?;
                    let end = offset
                        .checked_add(len)
                        .filter(|end| *end <= base.len())
                        .ok_or(DeltaError::OutOfBounds(pos))?;
                    out.extend_from_slice(&base[offset..end]);
                }
                OP_INSERT => {
                    if cursor.remaining() < 4 {
                        return Err(DeltaError::OutOfBounds(pos));
                    }
                    let len = cursor.get_u32() as usize;
                    if cursor.remaining() < len {
                        return Err(DeltaError::OutOfBounds(pos));
                    }
                    out.extend_from_slice(&cursor[..len]);
                    cursor.advance(len);
                }
                op => {
                    return Err(DeltaError::BadHeader(format!("unknown op {:#04x}", op)));
                }
            }
            if out.len() > target_len {
                return Err(DeltaError::OutOfBounds(pos));
            }
        }

        if cursor.has_remaining() {
            return Err(DeltaError::BadHeader("trailing bytes after end marker".to_string()));
        }
        if out.len() != target_len {
            return Err(DeltaError::LengthMismatch {
                expected: header.target_len,
                actual: out.len() as u64,
            });
        }

        debug!(
            from = %delta.from_version,
            to = %delta.to_version,
            output = out.len(),
            "Delta applied"
        );
        Ok(out)
    }
}
