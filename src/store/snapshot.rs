use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::domain::{Council, Evaluation, Proposal};
use crate::idempotency::IdempotencyRecord;

pub const SNAPSHOT_FORMAT_VERSION: &str = "1";

/// Errors that can occur while saving or loading a store snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Snapshot corruption detected: {reason}")]
    Corruption { reason: String },

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },
}

/// Whole-store contents as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub format_version: String,
    pub saved_at: DateTime<Utc>,
    pub integrity_hash: String,
    pub proposals: Vec<Proposal>,
    pub councils: Vec<Council>,
    pub evaluations: Vec<Evaluation>,
    pub idempotency: Vec<IdempotencyRecord>,
}

impl StoreSnapshot {
    pub fn new(
        proposals: Vec<Proposal>,
        councils: Vec<Council>,
        evaluations: Vec<Evaluation>,
        idempotency: Vec<IdempotencyRecord>,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION.to_string(),
            saved_at: Utc::now(),
            integrity_hash: String::new(),
            proposals,
            councils,
            evaluations,
            idempotency,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new(), Vec::new())
    }

    /// Hash over identities and versions, enough to catch truncated or hand-edited files.
    pub fn calculate_integrity_hash(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.format_version.hash(&mut hasher);
        for proposal in &self.proposals {
            proposal.id.hash(&mut hasher);
            proposal.version.hash(&mut hasher);
            proposal.state.hash(&mut hasher);
            proposal.workflow_log.len().hash(&mut hasher);
        }
        for council in &self.councils {
            council.id.hash(&mut hasher);
            council.member_ids.hash(&mut hasher);
        }
        for evaluation in &self.evaluations {
            evaluation.id.hash(&mut hasher);
            evaluation.state.hash(&mut hasher);
        }
        for record in &self.idempotency {
            record.key.hash(&mut hasher);
        }
        format!("{:x}", hasher.finish())
    }
}

#[async_trait]
pub trait SnapshotPersistence: Send + Sync {
    async fn save(&self, snapshot: &StoreSnapshot) -> Result<(), SnapshotError>;

    /// `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<StoreSnapshot>, SnapshotError>;
}

/// JSON snapshot on the local file system
#[derive(Debug, Clone)]
pub struct FileSystemPersistence {
    path: PathBuf,
}

impl FileSystemPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotPersistence for FileSystemPersistence {
    async fn save(&self, snapshot: &StoreSnapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut to_save = snapshot.clone();
        to_save.saved_at = Utc::now();
        to_save.integrity_hash = to_save.calculate_integrity_hash();
        let serialized = serde_json::to_string_pretty(&to_save)?;

        // Write to temporary file first, then rename (atomic operation)
        let temp_file = format!("{}.tmp", self.path.display());
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, &self.path).await?;

        info!(
            file = ?self.path,
            proposals = to_save.proposals.len(),
            councils = to_save.councils.len(),
            "Store snapshot saved"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<StoreSnapshot>, SnapshotError> {
        if !fs::try_exists(&self.path).await? {
            info!(file = ?self.path, "No existing snapshot found");
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path).await?;
        let snapshot: StoreSnapshot = serde_json::from_str(&contents)?;

        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: SNAPSHOT_FORMAT_VERSION.to_string(),
                found: snapshot.format_version,
            });
        }

        let actual_hash = snapshot.calculate_integrity_hash();
        if snapshot.integrity_hash != actual_hash {
            warn!(
                file = ?self.path,
                expected_hash = %snapshot.integrity_hash,
                actual_hash = %actual_hash,
                "Snapshot integrity check failed"
            );
            return Err(SnapshotError::Corruption {
                reason: "Integrity check failed".to_string(),
            });
        }

        info!(
            file = ?self.path,
            saved_at = %snapshot.saved_at,
            "Store snapshot loaded"
        );
        Ok(Some(snapshot))
    }
}
