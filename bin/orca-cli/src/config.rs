//! Agent settings file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/orca/agent.yaml";
pub const CHECKPOINT_FILE_NAME: &str = "applied-revisions.json";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    pub orchestrator_url: Option<String>,
    pub request_timeout_secs: u64,
    pub ping_interval_secs: u64,
    /// Negative means no limit.
    pub command_timeout_secs: i64,
    pub pid_file: PathBuf,
    pub bootstrap: BootstrapFileSettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            orchestrator_url: None,
            request_timeout_secs: 30,
            ping_interval_secs: 30,
            command_timeout_secs: -1,
            pid_file: orca_agent::default_pid_file(),
            bootstrap: BootstrapFileSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BootstrapFileSettings {
    pub directory: PathBuf,
    pub lines: i64,
    pub interval_secs: u64,
    pub splay_secs: u64,
    pub command_timeout_secs: i64,
    pub checkpoint_file: Option<PathBuf>,
    pub cleanup: bool,
}

impl Default for BootstrapFileSettings {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("orca-bootstrap"),
            lines: 10,
            interval_secs: 600,
            splay_secs: 360,
            command_timeout_secs: -1,
            checkpoint_file: None,
            cleanup: false,
        }
    }
}

impl BootstrapFileSettings {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_file
            .clone()
            .unwrap_or_else(|| self.directory.join(CHECKPOINT_FILE_NAME))
    }
}

impl AgentSettings {
    /// Loads `path`, or the default location when `path` is `None`. Only the
    /// default location may be absent.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(raw)?)
    }
}
