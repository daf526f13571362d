//! Bootstrapping cycles: one-shot or on an interval with random splay.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use orca_checkpoint::CheckpointStore;
use orca_protocol::{BootstrapConfiguration, CmsKind};
use orca_runner::CommandRunner;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::process::BootstrappingProcess;
use crate::workspace::PolicyWorkspace;
use crate::{BootstrapApi, BootstrapError, BootstrapResult};

pub const DEFAULT_THRESHOLD_LINES: i64 = 10;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_SPLAY: Duration = Duration::from_secs(360);

#[derive(Clone, Debug)]
pub struct BootstrapSettings {
    pub directory: PathBuf,
    pub cms: CmsKind,
    pub threshold_lines: i64,
    pub command_timeout: Option<Duration>,
    pub cleanup: bool,
}

impl BootstrapSettings {
    pub fn new(directory: impl Into<PathBuf>, cms: CmsKind) -> Self {
        Self {
            directory: directory.into(),
            cms,
            threshold_lines: DEFAULT_THRESHOLD_LINES,
            command_timeout: None,
            cleanup: false,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ConfigurationSource {
    Remote,
    Inline(BootstrapConfiguration),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Applied { policyfiles: usize },
    AlreadyApplied,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub splay: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            splay: DEFAULT_SPLAY,
        }
    }
}

impl Schedule {
    /// `interval` plus a uniformly random share of `splay`.
    pub fn next_delay(&self) -> Duration {
        let splay_ms = u64::try_from(self.splay.as_millis()).unwrap_or(u64::MAX);
        let jitter = if splay_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=splay_ms)
        };
        self.interval + Duration::from_millis(jitter)
    }
}

pub struct Bootstrapper<A> {
    api: A,
    runner: CommandRunner,
    workspace: Box<dyn PolicyWorkspace>,
    checkpoint: Box<dyn CheckpointStore>,
    settings: BootstrapSettings,
}

impl<A: BootstrapApi> Bootstrapper<A> {
    pub fn new(
        api: A,
        runner: CommandRunner,
        workspace: Box<dyn PolicyWorkspace>,
        checkpoint: Box<dyn CheckpointStore>,
        settings: BootstrapSettings,
    ) -> Self {
        Self {
            api,
            runner,
            workspace,
            checkpoint,
            settings,
        }
    }

    pub fn settings(&self) -> &BootstrapSettings {
        &self.settings
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Builds the process a cycle would run, seeded from the checkpoint.
    pub async fn prepare(&self, source: &ConfigurationSource) -> BootstrapResult<BootstrappingProcess> {
        let configuration = match source {
            ConfigurationSource::Remote => self.api.fetch_bootstrap_configuration().await?,
            ConfigurationSource::Inline(configuration) => configuration.clone(),
        };
        let applied = self.checkpoint.load()?;
        Ok(BootstrappingProcess::new(
            &self.settings.directory,
            configuration,
            self.settings.threshold_lines,
        )
        .with_command_timeout(self.settings.command_timeout)
        .resume_from(applied))
    }

    pub async fn run_cycle(&self, source: &ConfigurationSource) -> BootstrapResult<CycleOutcome> {
        let mut process = self.prepare(source).await?;
        if process.is_up_to_date() {
            info!(run_id = %process.run_id(), "configuration already applied");
            return Ok(CycleOutcome::AlreadyApplied);
        }

        fs::create_dir_all(&self.settings.directory).map_err(|err| {
            BootstrapError::Io(format!("{}: {err}", self.settings.directory.display()))
        })?;
        info!(
            run_id = %process.run_id(),
            cms = %self.settings.cms,
            policyfiles = process.policyfiles().len(),
            "bootstrapping started"
        );
        let result = process
            .apply(
                &self.api,
                &self.runner,
                self.settings.cms,
                self.workspace.as_ref(),
                self.checkpoint.as_ref(),
            )
            .await;
        if self.settings.cleanup {
            process.cleanup(self.settings.cms);
        }
        result?;

        self.api
            .report_applied_configuration(&process.applied_configuration(Utc::now()))
            .await?;
        info!(run_id = %process.run_id(), "bootstrapping finished");
        Ok(CycleOutcome::Applied {
            policyfiles: process.policyfiles().len(),
        })
    }

    /// Runs cycles until `cancel` fires. A failed cycle is logged and the next
    /// one is attempted on schedule. An in-flight cycle always completes.
    pub async fn run_continuously(
        &self,
        source: &ConfigurationSource,
        schedule: Schedule,
        cancel: CancellationToken,
    ) -> usize {
        let mut cycles = 0;
        loop {
            match self.run_cycle(source).await {
                Ok(outcome) => info!(?outcome, "bootstrapping cycle completed"),
                Err(err) => error!(
                    error = %err,
                    policyfile = err.failed_policyfile().unwrap_or("-"),
                    "bootstrapping cycle failed"
                ),
            }
            cycles += 1;

            let delay = schedule.next_delay();
            info!(delay_secs = delay.as_secs(), "next bootstrapping cycle scheduled");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        cycles
    }
}
