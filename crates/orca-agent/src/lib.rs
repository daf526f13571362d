//! Host agent runtime: command polling, single-flight execution, and process lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use orca_protocol::{Command, Ping, RemoteError, RemoteResult};
use orca_runner::{CommandRunner, RunnerError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod execution;
pub mod polling;
pub mod process_handle;
pub mod signal;

pub use execution::execute_next_command;
pub use polling::{LoopSummary, PollingConfig, PollingLoop, DEFAULT_PING_INTERVAL};
pub use process_handle::{default_pid_file, stop_agent, PidFileHandle, ProcessHandle};
pub use signal::{
    join_signal_handler, spawn_signal_handler, ShutdownListener, ShutdownSignal,
};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("remote failure: {0}")]
    Remote(String),
    #[error("execution failure: {0}")]
    Execution(String),
    #[error("process handle failure: {0}")]
    ProcessHandle(String),
    #[error("signal failure: {0}")]
    Signal(String),
}

impl From<RemoteError> for AgentError {
    fn from(value: RemoteError) -> Self {
        AgentError::Remote(value.to_string())
    }
}

impl From<RunnerError> for AgentError {
    fn from(value: RunnerError) -> Self {
        AgentError::Execution(value.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Remote operations the agent needs from the orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn ping(&self) -> RemoteResult<Ping>;
    async fn fetch_next_command(&self) -> RemoteResult<Command>;
    async fn report_command_result(&self, command: &Command) -> RemoteResult<()>;
}

/// Runs the agent until a termination signal arrives.
pub async fn run_agent<O, H>(
    orchestrator: Arc<O>,
    runner: CommandRunner,
    config: PollingConfig,
    handle: &H,
) -> AgentResult<LoopSummary>
where
    O: Orchestrator + 'static,
    H: ProcessHandle + ?Sized,
{
    let cancel = CancellationToken::new();
    run_agent_until(orchestrator, runner, config, handle, cancel).await
}

/// Like [`run_agent`], but also stops when `cancel` is triggered by the caller.
pub async fn run_agent_until<O, H>(
    orchestrator: Arc<O>,
    runner: CommandRunner,
    config: PollingConfig,
    handle: &H,
    cancel: CancellationToken,
) -> AgentResult<LoopSummary>
where
    O: Orchestrator + 'static,
    H: ProcessHandle + ?Sized,
{
    handle.register()?;

    let signals = match spawn_signal_handler(cancel.clone()) {
        Ok(task) => task,
        Err(err) => {
            if let Err(release_err) = handle.release() {
                warn!(error = %release_err, "failed to release process handle");
            }
            return Err(err);
        }
    };

    info!(pid = std::process::id(), "orca agent started");
    let summary = PollingLoop::new(orchestrator, runner, config)
        .run(cancel.clone())
        .await;

    cancel.cancel();
    join_signal_handler(signals).await;

    handle.release()?;
    info!("orca agent stopped");
    Ok(summary)
}
