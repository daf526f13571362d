//! Host bootstrapping: ordered policyfile application with streamed logs and
//! resumable progress.

use async_trait::async_trait;
use orca_checkpoint::CheckpointError;
use orca_protocol::{
    AppliedConfiguration, BootstrapConfiguration, BootstrapLogChunk, RemoteError, RemoteResult,
};
use thiserror::Error;

pub mod cms;
pub mod cycle;
pub mod process;
pub mod reporter;
pub mod workspace;

pub use cms::{render_command, write_inputs, PreparedRun};
pub use cycle::{BootstrapSettings, Bootstrapper, ConfigurationSource, CycleOutcome, Schedule};
pub use process::BootstrappingProcess;
pub use reporter::{detect_cms_version, BootstrapLogReporter};
pub use workspace::{host_workspace, InPlaceWorkspace, PolicyWorkspace, RenamingWorkspace};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("remote failure: {0}")]
    Remote(String),
    #[error("io failure: {0}")]
    Io(String),
    #[error("checkpoint failure: {0}")]
    Checkpoint(String),
    #[error("policyfile {policyfile_id} (revision {revision_id}) failed with exit code {exit_code}")]
    PolicyfileFailed {
        policyfile_id: String,
        revision_id: String,
        exit_code: i32,
    },
    #[error("policyfile {policyfile_id} could not be executed: {reason}")]
    Execution {
        policyfile_id: String,
        reason: String,
    },
}

impl BootstrapError {
    /// Identity of the policyfile that aborted the run, if any.
    pub fn failed_policyfile(&self) -> Option<&str> {
        match self {
            Self::PolicyfileFailed { policyfile_id, .. } | Self::Execution { policyfile_id, .. } => {
                Some(policyfile_id)
            }
            _ => None,
        }
    }
}

impl From<RemoteError> for BootstrapError {
    fn from(value: RemoteError) -> Self {
        BootstrapError::Remote(value.to_string())
    }
}

impl From<CheckpointError> for BootstrapError {
    fn from(value: CheckpointError) -> Self {
        BootstrapError::Checkpoint(value.to_string())
    }
}

pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// Remote operations used during bootstrapping.
#[async_trait]
pub trait BootstrapApi: Send + Sync {
    async fn fetch_bootstrap_configuration(&self) -> RemoteResult<BootstrapConfiguration>;
    async fn report_bootstrap_log_chunk(&self, chunk: &BootstrapLogChunk) -> RemoteResult<()>;
    async fn report_applied_configuration(
        &self,
        applied: &AppliedConfiguration,
    ) -> RemoteResult<()>;
}
