//! Shared wire types exchanged between the host agent and the orchestrator.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const ATTRIBUTES_FILE_NAME: &str = "attrs.json";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode failure: {0}")]
    Decode(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    #[serde(default)]
    pub pending_commands: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub id: String,
    pub script: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

impl Command {
    pub fn new(id: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: script.into(),
            ..Self::default()
        }
    }

    /// Stores captured output on the side matching the exit code: stdout for
    /// success, stderr for anything else. The other side is cleared.
    pub fn record_result(&mut self, output: String, exit_code: i32) {
        self.exit_code = exit_code;
        if exit_code == 0 {
            self.stdout = output;
            self.stderr.clear();
        } else {
            self.stderr = output;
            self.stdout.clear();
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyFile {
    pub id: String,
    pub revision_id: String,
}

impl PolicyFile {
    pub fn new(id: impl Into<String>, revision_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision_id: revision_id.into(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}-{}", self.id, self.revision_id)
    }

    pub fn path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(self.name())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Attributes {
    #[serde(default)]
    pub revision_id: Option<String>,
    #[serde(default)]
    pub raw_data: Map<String, Value>,
}

impl Attributes {
    pub fn file_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(ATTRIBUTES_FILE_NAME)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BootstrapConfiguration {
    #[serde(default)]
    pub policyfiles: Vec<PolicyFile>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CmsKind {
    Chef,
    Ansible,
}

impl CmsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chef => "chef",
            Self::Ansible => "ansible",
        }
    }
}

impl fmt::Display for CmsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CmsKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "chef" => Ok(Self::Chef),
            "ansible" => Ok(Self::Ansible),
            other => Err(format!("unsupported configuration management system: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapRunMetadata {
    pub run_id: String,
    pub policyfile_id: String,
    pub policyfile_revision_id: String,
    #[serde(default)]
    pub cms_version: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapLogChunk {
    pub stdout: String,
    pub metadata: BootstrapRunMetadata,
    pub reported_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedConfiguration {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub policyfile_revision_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub attribute_revision_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_result_lands_in_stdout() {
        let mut command = Command::new("c1", "echo hi");
        command.stderr = "stale".to_string();
        command.record_result("hi\n".to_string(), 0);

        assert_eq!(command.stdout, "hi\n");
        assert!(command.stderr.is_empty());
        assert!(command.succeeded());
    }

    #[test]
    fn failed_result_lands_in_stderr_and_clears_stdout() {
        let mut command = Command::new("c2", "false");
        command.stdout = "stale".to_string();
        command.record_result("boom\n".to_string(), 2);

        assert!(command.stdout.is_empty());
        assert_eq!(command.stderr, "boom\n");
        assert_eq!(command.exit_code, 2);
    }

    #[test]
    fn policyfile_path_joins_id_and_revision() {
        let policyfile = PolicyFile::new("web", "r42");
        assert_eq!(
            policyfile.path(Path::new("/var/orca")),
            PathBuf::from("/var/orca/web-r42")
        );
    }

    #[test]
    fn command_decodes_without_result_fields() {
        let command: Command =
            serde_json::from_str(r#"{"id":"c1","script":"uptime"}"#).expect("decode");
        assert_eq!(command, Command::new("c1", "uptime"));
    }

    #[test]
    fn cms_kind_parses_case_insensitively() {
        assert_eq!("Chef".parse::<CmsKind>(), Ok(CmsKind::Chef));
        assert_eq!(" ansible ".parse::<CmsKind>(), Ok(CmsKind::Ansible));
        assert!("puppet".parse::<CmsKind>().is_err());
    }
}
