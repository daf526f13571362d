//! Checkpoint interface for applied policyfile revisions.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("read failure: {0}")]
    Read(String),
    #[error("write failure: {0}")]
    Write(String),
    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedRevisions {
    #[serde(default)]
    pub policyfiles: BTreeMap<String, String>,
    #[serde(default)]
    pub attribute_revision_id: Option<String>,
    #[serde(default)]
    pub updated_unix: u64,
}

impl AppliedRevisions {
    pub fn is_applied(&self, policyfile_id: &str, revision_id: &str) -> bool {
        self.policyfiles
            .get(policyfile_id)
            .is_some_and(|applied| applied == revision_id)
    }

    pub fn touch(&mut self) {
        self.updated_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
    }
}

pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<AppliedRevisions, CheckpointError>;
    fn save(&self, revisions: &AppliedRevisions) -> Result<(), CheckpointError>;
}

#[derive(Clone, Debug, Default)]
pub struct NoopCheckpointStore;

impl CheckpointStore for NoopCheckpointStore {
    fn load(&self) -> Result<AppliedRevisions, CheckpointError> {
        Ok(AppliedRevisions::default())
    }

    fn save(&self, _revisions: &AppliedRevisions) -> Result<(), CheckpointError> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpointStore {
    revisions: Arc<Mutex<AppliedRevisions>>,
}

impl MemoryCheckpointStore {
    pub fn snapshot(&self) -> AppliedRevisions {
        self.revisions
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<AppliedRevisions, CheckpointError> {
        self.revisions
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| CheckpointError::Read("poisoned lock".to_string()))
    }

    fn save(&self, revisions: &AppliedRevisions) -> Result<(), CheckpointError> {
        *self
            .revisions
            .lock()
            .map_err(|_| CheckpointError::Write("poisoned lock".to_string()))? = revisions.clone();
        Ok(())
    }
}

/// Stores the checkpoint as pretty JSON, replacing the file atomically.
#[derive(Clone, Debug)]
pub struct JsonFileCheckpointStore {
    path: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn load(&self) -> Result<AppliedRevisions, CheckpointError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint yet");
                return Ok(AppliedRevisions::default());
            }
            Err(e) => {
                return Err(CheckpointError::Read(format!(
                    "{}: {e}",
                    self.path.display()
                )))
            }
        };
        serde_json::from_str(&raw)
            .map_err(|e| CheckpointError::Corrupt(format!("{}: {e}", self.path.display())))
    }

    fn save(&self, revisions: &AppliedRevisions) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CheckpointError::Write(format!("{}: {e}", parent.display())))?;
        }
        let body = serde_json::to_string_pretty(revisions)
            .map_err(|e| CheckpointError::Write(format!("serialization failed: {e}")))?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, body)
            .map_err(|e| CheckpointError::Write(format!("{}: {e}", staging.display())))?;
        fs::rename(&staging, &self.path)
            .map_err(|e| CheckpointError::Write(format!("{}: {e}", self.path.display())))
    }
}
