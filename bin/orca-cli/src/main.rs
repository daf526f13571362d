use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use orca_agent::{
    join_signal_handler, run_agent, spawn_signal_handler, stop_agent, PidFileHandle,
    PollingConfig,
};
use orca_bootstrap::{
    host_workspace, BootstrapApi, BootstrapSettings, Bootstrapper, ConfigurationSource,
    CycleOutcome, Schedule,
};
use orca_checkpoint::JsonFileCheckpointStore;
use orca_http::HttpOrchestrator;
use orca_protocol::{
    AppliedConfiguration, BootstrapConfiguration, BootstrapLogChunk, CmsKind, RemoteError,
    RemoteResult,
};
use orca_runner::{timeout_from_secs, CommandRunner};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::AgentSettings;

const DEFAULT_LOG_FILTER: &str = "orca=info";

#[derive(Clone, Debug, Parser)]
#[command(name = "orca-cli")]
#[command(about = "Orca host agent and bootstrapper")]
struct Cli {
    /// Settings file; defaults to /etc/orca/agent.yaml when present.
    #[arg(long = "config", global = true)]
    config_path: Option<PathBuf>,
    #[arg(long, global = true)]
    orchestrator_url: Option<String>,
    /// Log level for orca crates; overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Clone, Debug, Subcommand)]
enum CliCommand {
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
    Bootstrap {
        #[command(subcommand)]
        command: BootstrapCommand,
    },
}

#[derive(Clone, Debug, Subcommand)]
enum AgentCommand {
    /// Poll the orchestrator and run commands until SIGINT/SIGTERM.
    Start {
        #[arg(long)]
        ping_interval: Option<u64>,
        /// Seconds; negative disables the limit.
        #[arg(long, allow_negative_numbers = true)]
        command_timeout: Option<i64>,
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },
    /// Send SIGTERM to the running agent.
    Stop {
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },
}

#[derive(Clone, Debug, Subcommand)]
enum BootstrapCommand {
    Apply {
        #[arg(long, value_enum)]
        cms: CmsArg,
        /// Local JSON configuration used instead of fetching one.
        #[arg(long)]
        configuration_file: Option<PathBuf>,
        #[arg(long)]
        directory: Option<PathBuf>,
        /// Lines per uploaded chunk; 0 uploads the whole output once.
        #[arg(long, allow_negative_numbers = true)]
        lines: Option<i64>,
        #[arg(long)]
        run_once: bool,
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        splay: Option<u64>,
        #[arg(long)]
        cleanup: bool,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CmsArg {
    Chef,
    Ansible,
}

impl From<CmsArg> for CmsKind {
    fn from(value: CmsArg) -> Self {
        match value {
            CmsArg::Chef => CmsKind::Chef,
            CmsArg::Ansible => CmsKind::Ansible,
        }
    }
}

/// Used when no orchestrator is configured: logs go to stdout and nothing can
/// be fetched.
#[derive(Clone, Debug, Default)]
struct StdoutBootstrapApi;

#[async_trait]
impl BootstrapApi for StdoutBootstrapApi {
    async fn fetch_bootstrap_configuration(&self) -> RemoteResult<BootstrapConfiguration> {
        Err(RemoteError::Transport(
            "no orchestrator_url configured; pass --configuration-file".to_string(),
        ))
    }

    async fn report_bootstrap_log_chunk(&self, chunk: &BootstrapLogChunk) -> RemoteResult<()> {
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(chunk.stdout.as_bytes())
            .and_then(|()| stdout.flush())
            .map_err(|err| RemoteError::Transport(format!("stdout: {err}")))
    }

    async fn report_applied_configuration(
        &self,
        applied: &AppliedConfiguration,
    ) -> RemoteResult<()> {
        let body = serde_json::to_string(applied)
            .map_err(|err| RemoteError::Decode(err.to_string()))?;
        println!("applied configuration (stdout reporter): {body}");
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct ApplyOptions {
    cms: CmsKind,
    configuration_file: Option<PathBuf>,
    run_once: bool,
    dry_run: bool,
    schedule: Schedule,
}

fn init_tracing(log_level: Option<&str>) -> anyhow::Result<()> {
    let filter = match log_level {
        Some(level) => tracing_subscriber::EnvFilter::try_new(format!("orca={level}"))
            .with_context(|| format!("invalid log level {level}"))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

fn http_orchestrator(settings: &AgentSettings) -> anyhow::Result<HttpOrchestrator> {
    let url = settings
        .orchestrator_url
        .as_deref()
        .ok_or_else(|| anyhow!("orchestrator_url is not configured"))?;
    HttpOrchestrator::new(url, Duration::from_secs(settings.request_timeout_secs))
        .context("failed to create orchestrator client")
}

async fn handle_agent_command(command: AgentCommand, mut settings: AgentSettings) -> anyhow::Result<()> {
    match command {
        AgentCommand::Start {
            ping_interval,
            command_timeout,
            pid_file,
        } => {
            if let Some(secs) = ping_interval {
                settings.ping_interval_secs = secs;
            }
            if let Some(secs) = command_timeout {
                settings.command_timeout_secs = secs;
            }
            if let Some(path) = pid_file {
                settings.pid_file = path;
            }
            if settings.ping_interval_secs == 0 {
                return Err(anyhow!("ping interval must be at least one second"));
            }

            let orchestrator = Arc::new(http_orchestrator(&settings)?);
            let handle = PidFileHandle::new(&settings.pid_file);
            info!(
                orchestrator = %orchestrator.base_url(),
                pid_file = %settings.pid_file.display(),
                "agent starting"
            );
            let summary = run_agent(
                orchestrator,
                CommandRunner::new(),
                PollingConfig {
                    ping_interval: Duration::from_secs(settings.ping_interval_secs),
                    command_timeout: timeout_from_secs(settings.command_timeout_secs),
                },
                &handle,
            )
            .await
            .context("agent failed")?;
            info!(?summary, "agent stopped");
            Ok(())
        }
        AgentCommand::Stop { pid_file } => {
            let handle = PidFileHandle::new(pid_file.unwrap_or(settings.pid_file));
            let pid = stop_agent(&handle).context("failed to stop agent")?;
            println!("sent SIGTERM to agent pid={pid}");
            Ok(())
        }
    }
}

async fn handle_bootstrap_command(
    command: BootstrapCommand,
    mut settings: AgentSettings,
) -> anyhow::Result<()> {
    let BootstrapCommand::Apply {
        cms,
        configuration_file,
        directory,
        lines,
        run_once,
        interval,
        splay,
        cleanup,
        dry_run,
    } = command;

    if let Some(directory) = directory {
        settings.bootstrap.directory = directory;
    }
    if let Some(lines) = lines {
        settings.bootstrap.lines = lines;
    }
    if let Some(secs) = interval {
        settings.bootstrap.interval_secs = secs;
    }
    if let Some(secs) = splay {
        settings.bootstrap.splay_secs = secs;
    }
    settings.bootstrap.cleanup |= cleanup;

    let options = ApplyOptions {
        cms: cms.into(),
        configuration_file,
        run_once,
        dry_run,
        schedule: Schedule {
            interval: Duration::from_secs(settings.bootstrap.interval_secs),
            splay: Duration::from_secs(settings.bootstrap.splay_secs),
        },
    };

    if settings.orchestrator_url.is_some() {
        let api = http_orchestrator(&settings)?;
        run_bootstrap(api, &settings, options).await
    } else {
        run_bootstrap(StdoutBootstrapApi, &settings, options).await
    }
}

async fn run_bootstrap<A: BootstrapApi>(
    api: A,
    settings: &AgentSettings,
    options: ApplyOptions,
) -> anyhow::Result<()> {
    let source = match &options.configuration_file {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read configuration file {}", path.display()))?;
            let configuration: BootstrapConfiguration = serde_json::from_str(&raw)
                .with_context(|| format!("invalid configuration file {}", path.display()))?;
            ConfigurationSource::Inline(configuration)
        }
        None => ConfigurationSource::Remote,
    };

    let bootstrap = &settings.bootstrap;
    let bootstrapper = Bootstrapper::new(
        api,
        CommandRunner::new(),
        host_workspace(),
        Box::new(JsonFileCheckpointStore::new(bootstrap.checkpoint_path())),
        BootstrapSettings {
            directory: bootstrap.directory.clone(),
            cms: options.cms,
            threshold_lines: bootstrap.lines,
            command_timeout: timeout_from_secs(bootstrap.command_timeout_secs),
            cleanup: bootstrap.cleanup,
        },
    );

    if options.dry_run {
        let process = bootstrapper
            .prepare(&source)
            .await
            .context("failed to load bootstrap configuration")?;
        if process.is_up_to_date() {
            println!("DRY-RUN bootstrap configuration already applied");
        }
        for (policyfile, run) in process.planned_commands(options.cms) {
            println!(
                "DRY-RUN bootstrap policyfile={} command={}",
                policyfile.id, run.command
            );
        }
        return Ok(());
    }

    if options.run_once {
        let outcome = bootstrapper
            .run_cycle(&source)
            .await
            .context("bootstrapping failed")?;
        match outcome {
            CycleOutcome::Applied { policyfiles } => {
                println!("bootstrap applied policyfiles={policyfiles}")
            }
            CycleOutcome::AlreadyApplied => println!("bootstrap configuration already applied"),
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signals = spawn_signal_handler(cancel.clone()).context("failed to install signal handlers")?;
    let cycles = bootstrapper
        .run_continuously(&source, options.schedule, cancel.clone())
        .await;
    cancel.cancel();
    join_signal_handler(signals).await;
    info!(cycles, "bootstrapper stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    let mut settings = AgentSettings::load(cli.config_path.as_deref())?;
    if let Some(url) = cli.orchestrator_url {
        settings.orchestrator_url = Some(url);
    }

    match cli.command {
        CliCommand::Agent { command } => handle_agent_command(command, settings).await,
        CliCommand::Bootstrap { command } => handle_bootstrap_command(command, settings).await,
    }
}
