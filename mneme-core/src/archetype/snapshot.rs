//! Durable registry snapshot
//!
//! The registry persists its complete state as a single JSON snapshot. A
//! write goes to a temporary file in the same directory, is fsynced, and is
//! then renamed over the previous snapshot, so a crash at any point leaves
//! either the old or the new complete snapshot on disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::types::{ArchetypeChain, ArchetypeId};
use crate::error::{MnemeError, Result};

/// Snapshot format understood by this build
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Complete persisted registry state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Incremented on every successful write
    pub generation: u64,
    /// When the snapshot was written
    pub written_at: DateTime<Utc>,
    /// Hex SHA-256 of the serialized chains
    pub digest: String,
    /// Every registered chain
    pub chains: BTreeMap<ArchetypeId, ArchetypeChain>,
}

impl RegistrySnapshot {
    /// Empty generation-zero snapshot
    pub fn empty() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            generation: 0,
            written_at: Utc::now(),
            digest: String::new(),
            chains: BTreeMap::new(),
        }
    }

    /// Build the successor snapshot with `chain` inserted
    pub fn with_chain(&self, chain: ArchetypeChain) -> Result<Self> {
        let mut chains = self.chains.clone();
        chains.insert(chain.id().clone(), chain);
        let digest = Self::compute_digest(&chains)?;
        Ok(Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            generation: self.generation + 1,
            written_at: Utc::now(),
            digest,
            chains,
        })
    }

    /// Verify the stored digest against the chains
    pub fn verify(&self) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(MnemeError::StorageUnavailable(format!(
                "unsupported snapshot format version {}",
                self.format_version
            )));
        }
        let expected = Self::compute_digest(&self.chains)?;
        if expected != self.digest {
            return Err(MnemeError::StorageUnavailable(format!(
                "snapshot generation {} failed integrity check",
                self.generation
            )));
        }
        Ok(())
    }

    fn compute_digest(chains: &BTreeMap<ArchetypeId, ArchetypeChain>) -> Result<String> {
        let bytes = serde_json::to_vec(chains)?;
        let hash = Sha256::digest(&bytes);
        Ok(hash.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

/// Durable storage for registry snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Read the latest snapshot; `None` when nothing was ever written
    async fn load(&self) -> Result<Option<RegistrySnapshot>>;

    /// Atomically replace the stored snapshot
    async fn persist(&self, snapshot: &RegistrySnapshot) -> Result<()>;
}

/// Snapshot store backed by a flat file with atomic replace
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<RegistrySnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MnemeError::StorageUnavailable(format!(
                    "failed to read snapshot '{}': {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let snapshot: RegistrySnapshot = serde_json::from_slice(&bytes).map_err(|e| {
            MnemeError::StorageUnavailable(format!(
                "snapshot '{}' is not valid: {}",
                self.path.display(),
                e
            ))
        })?;
        snapshot.verify()?;
        Ok(Some(snapshot))
    }

    async fn persist(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| MnemeError::Other(format!("snapshot writer task failed: {}", e)))?
    }
}

/// Write `bytes` to `path` via temp file + fsync + rename + directory fsync
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(MnemeError::StorageUnavailable(format!(
            "failed to persist snapshot '{}': {}",
            path.display(),
            e
        )));
    }

    // Flush the directory entry so the rename itself is durable.
    #[cfg(unix)]
    {
        if let Ok(dir_file) = std::fs::File::open(&dir) {
            let _ = dir_file.sync_all();
        }
    }

    Ok(())
}
