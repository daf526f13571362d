//! Where the configuration-management tool runs for a given policyfile.
//!
//! Chef on Windows cannot operate on arbitrarily named policy directories, so
//! there the directory is moved to a fixed name for the duration of the run.
//! Every other platform runs in place.

use std::fs;
use std::path::{Path, PathBuf};

use orca_protocol::PolicyFile;
use tracing::{debug, warn};

pub const ACTIVE_DIRECTORY_NAME: &str = "active";

pub trait PolicyWorkspace: Send + Sync {
    /// Returns the directory the tool should run in.
    fn enter(&self, base_dir: &Path, policyfile: &PolicyFile) -> PathBuf;
    fn leave(&self, base_dir: &Path, policyfile: &PolicyFile, active: &Path);
}

#[derive(Clone, Debug, Default)]
pub struct InPlaceWorkspace;

impl PolicyWorkspace for InPlaceWorkspace {
    fn enter(&self, base_dir: &Path, policyfile: &PolicyFile) -> PathBuf {
        policyfile.path(base_dir)
    }

    fn leave(&self, _base_dir: &Path, _policyfile: &PolicyFile, _active: &Path) {}
}

#[derive(Clone, Debug)]
pub struct RenamingWorkspace {
    active_name: String,
}

impl Default for RenamingWorkspace {
    fn default() -> Self {
        Self {
            active_name: ACTIVE_DIRECTORY_NAME.to_string(),
        }
    }
}

impl PolicyWorkspace for RenamingWorkspace {
    /// Rename failures are logged and not retried; the tool then runs on the
    /// original path.
    fn enter(&self, base_dir: &Path, policyfile: &PolicyFile) -> PathBuf {
        let original = policyfile.path(base_dir);
        let active = base_dir.join(&self.active_name);
        match fs::rename(&original, &active) {
            Ok(()) => {
                debug!(from = %original.display(), to = %active.display(), "policyfile activated");
                active
            }
            Err(err) => {
                warn!(
                    policyfile = %policyfile.id,
                    error = %err,
                    "failed to move policyfile into the active directory"
                );
                original
            }
        }
    }

    fn leave(&self, base_dir: &Path, policyfile: &PolicyFile, active: &Path) {
        let original = policyfile.path(base_dir);
        if active == original {
            return;
        }
        if let Err(err) = fs::rename(active, &original) {
            warn!(
                policyfile = %policyfile.id,
                error = %err,
                "failed to restore policyfile directory name"
            );
        }
    }
}

pub fn host_workspace() -> Box<dyn PolicyWorkspace> {
    if cfg!(windows) {
        Box::new(RenamingWorkspace::default())
    } else {
        Box::new(InPlaceWorkspace)
    }
}
