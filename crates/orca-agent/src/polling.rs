use std::future;
use std::sync::Arc;
use std::time::Duration;

use orca_protocol::Command;
use orca_runner::CommandRunner;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::execution::execute_next_command;
use crate::{AgentResult, Orchestrator};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollingConfig {
    pub ping_interval: Duration,
    pub command_timeout: Option<Duration>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            command_timeout: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub pings: u64,
    pub ping_failures: u64,
    pub executions: u64,
    pub execution_failures: u64,
}

type ExecutionTask = JoinHandle<AgentResult<Command>>;

/// Owned by the loop task only; at most one execution exists at a time.
enum ExecutionState {
    Idle,
    Executing(ExecutionTask),
}

impl ExecutionState {
    fn is_executing(&self) -> bool {
        matches!(self, Self::Executing(_))
    }

    async fn finished(&mut self) -> Result<AgentResult<Command>, JoinError> {
        match self {
            Self::Executing(task) => task.await,
            Self::Idle => future::pending().await,
        }
    }
}

pub struct PollingLoop<O> {
    orchestrator: Arc<O>,
    runner: CommandRunner,
    config: PollingConfig,
}

impl<O> PollingLoop<O>
where
    O: Orchestrator + 'static,
{
    pub fn new(orchestrator: Arc<O>, runner: CommandRunner, config: PollingConfig) -> Self {
        Self {
            orchestrator,
            runner,
            config,
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Pings on every tick until `cancel` fires. An execution still running at
    /// cancellation is awaited so its result gets reported.
    pub async fn run(&self, cancel: CancellationToken) -> LoopSummary {
        let period = self.config.ping_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = ExecutionState::Idle;
        let mut summary = LoopSummary::default();
        info!(interval = ?period, "polling loop started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                joined = state.finished() => {
                    state = ExecutionState::Idle;
                    record_outcome(joined, &mut summary);
                }
                _ = ticker.tick() => {
                    if state.is_executing() {
                        debug!("command in flight, skipping ping");
                        continue;
                    }
                    summary.pings += 1;
                    let answer = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        answer = self.orchestrator.ping() => answer,
                    };
                    match answer {
                        Ok(ping) if ping.pending_commands => {
                            summary.executions += 1;
                            state = ExecutionState::Executing(self.spawn_execution());
                        }
                        Ok(_) => debug!("no pending commands"),
                        Err(err) => {
                            summary.ping_failures += 1;
                            warn!(error = %err, "ping failed");
                        }
                    }
                }
            }
        }

        if let ExecutionState::Executing(task) = state {
            info!("waiting for in-flight command before stopping");
            record_outcome(task.await, &mut summary);
        }
        info!(?summary, "polling loop stopped");
        summary
    }

    fn spawn_execution(&self) -> ExecutionTask {
        let orchestrator = Arc::clone(&self.orchestrator);
        let runner = self.runner.clone();
        let timeout = self.config.command_timeout;
        tokio::spawn(async move {
            execute_next_command(orchestrator.as_ref(), &runner, timeout).await
        })
    }
}

fn record_outcome(joined: Result<AgentResult<Command>, JoinError>, summary: &mut LoopSummary) {
    match joined {
        Ok(Ok(command)) => debug!(command_id = %command.id, "execution finished"),
        Ok(Err(err)) => {
            summary.execution_failures += 1;
            warn!(error = %err, "command cycle failed");
        }
        Err(err) => {
            summary.execution_failures += 1;
            error!(error = %err, "command execution task aborted");
        }
    }
}
