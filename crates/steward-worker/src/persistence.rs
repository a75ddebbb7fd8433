// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence of the last applied state.
//!
//! The record is read once at start-up and rewritten after every apply
//! that got as far as recording its state.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::state::State;

/// Current record format version.
pub const RECORD_VERSION: u32 = 1;

const RECORD_FILE: &str = "state.json";

/// Persistence errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistenceError {
    /// Reading or writing the record failed.
    #[error("IO error on {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The record is not valid JSON of the expected shape.
    #[error("Malformed record: {0}")]
    Json(#[from] serde_json::Error),

    /// The worker id cannot be used as a directory name.
    #[error("Invalid worker id '{0}': use letters, digits, '-', '_' or '.'")]
    InvalidWorkerId(String),

    /// The record was written by an incompatible version.
    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u32),

    /// The record does not match its checksum or its worker.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Storage for the last applied state.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load the record. `None` means nothing was saved yet.
    async fn load(&self) -> Result<Option<State>, PersistenceError>;

    /// Replace the record.
    async fn save(&self, state: &State) -> Result<(), PersistenceError>;
}

/// The serialized record.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Format version.
    pub version: u32,
    /// Worker the record belongs to.
    pub worker_id: String,
    /// When the record was written.
    pub saved_at: DateTime<Utc>,
    /// [`State::fingerprint`] of `state`.
    pub checksum: String,
    /// The applied state.
    pub state: State,
}

/// File-backed store writing `<state_dir>/<worker_id>/state.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    worker_id: String,
}

fn io_err(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn valid_worker_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl FileStore {
    /// Create a store for one worker.
    pub fn new(
        state_dir: impl Into<PathBuf>,
        worker_id: impl Into<String>,
    ) -> Result<Self, PersistenceError> {
        let worker_id = worker_id.into();
        if !valid_worker_id(&worker_id) {
            return Err(PersistenceError::InvalidWorkerId(worker_id));
        }
        Ok(Self {
            dir: state_dir.into().join(&worker_id),
            worker_id,
        })
    }

    /// Path of the record file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }
}

#[async_trait]
impl Persistence for FileStore {
    async fn load(&self) -> Result<Option<State>, PersistenceError> {
        let path = self.path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };

        let record: PersistedRecord = serde_json::from_slice(&bytes)?;
        if record.version != RECORD_VERSION {
            return Err(PersistenceError::UnsupportedVersion(record.version));
        }
        if record.worker_id != self.worker_id {
            return Err(PersistenceError::Corrupt(format!(
                "record belongs to worker '{}'",
                record.worker_id
            )));
        }
        if record.checksum != record.state.fingerprint() {
            return Err(PersistenceError::Corrupt("checksum mismatch".to_string()));
        }

        debug!(path = %path.display(), saved_at = %record.saved_at, "loaded state record");
        Ok(Some(record.state))
    }

    async fn save(&self, state: &State) -> Result<(), PersistenceError> {
        let record = PersistedRecord {
            version: RECORD_VERSION,
            worker_id: self.worker_id.clone(),
            saved_at: Utc::now(),
            checksum: state.fingerprint(),
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))?;

        let tmp_path = self.dir.join(format!("{RECORD_FILE}.tmp"));
        let final_path = self.path();

        if let Err(e) = replace_file(&tmp_path, &final_path, &bytes).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %tmp_path.display(), error = %cleanup, "failed to remove temp file");
            }
            return Err(e);
        }
        sync_dir(&self.dir).await;

        debug!(path = %final_path.display(), checksum = %record.checksum, "saved state record");
        Ok(())
    }
}

// Writes and syncs `tmp_path`, then renames it over `final_path`.
async fn replace_file(tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let mut file = tokio::fs::File::create(tmp_path)
        .await
        .map_err(|e| io_err(tmp_path, e))?;
    file.write_all(bytes).await.map_err(|e| io_err(tmp_path, e))?;
    file.sync_all().await.map_err(|e| io_err(tmp_path, e))?;
    drop(file);

    tokio::fs::rename(tmp_path, final_path)
        .await
        .map_err(|e| io_err(final_path, e))
}

// Makes the rename durable. Not every platform can open a directory.
async fn sync_dir(dir: &Path) {
    if let Ok(handle) = tokio::fs::File::open(dir).await
        && let Err(e) = handle.sync_all().await
    {
        debug!(dir = %dir.display(), error = %e, "directory sync failed");
    }
}
