//! State of one bootstrapping run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use orca_checkpoint::{AppliedRevisions, CheckpointStore};
use orca_protocol::{
    AppliedConfiguration, Attributes, BootstrapConfiguration, BootstrapRunMetadata, CmsKind,
    PolicyFile,
};
use orca_runner::{Chunking, CommandRunner};
use tracing::{info, warn};

use crate::cms::{self, PreparedRun};
use crate::reporter::BootstrapLogReporter;
use crate::workspace::PolicyWorkspace;
use crate::{BootstrapApi, BootstrapError, BootstrapResult};

#[derive(Clone, Debug)]
pub struct BootstrappingProcess {
    directory_path: PathBuf,
    policyfiles: Vec<PolicyFile>,
    attributes: Attributes,
    applied_policyfile_revision_ids: BTreeMap<String, String>,
    threshold_lines: i64,
    cms_version: String,
    command_timeout: Option<Duration>,
    resumed: bool,
    run_id: String,
    started_at: DateTime<Utc>,
}

impl BootstrappingProcess {
    pub fn new(
        directory_path: impl Into<PathBuf>,
        configuration: BootstrapConfiguration,
        threshold_lines: i64,
    ) -> Self {
        let started_at = Utc::now();
        Self {
            directory_path: directory_path.into(),
            policyfiles: configuration.policyfiles,
            attributes: configuration.attributes,
            applied_policyfile_revision_ids: BTreeMap::new(),
            threshold_lines,
            cms_version: String::new(),
            command_timeout: None,
            resumed: false,
            run_id: format!(
                "bootstrap-{}-{}",
                std::process::id(),
                started_at.timestamp_millis()
            ),
            started_at,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Seeds applied revisions from an earlier run. The checkpoint only
    /// counts when it was written for the same attribute revision; otherwise
    /// every policyfile is applied again.
    pub fn resume_from(mut self, checkpoint: AppliedRevisions) -> Self {
        if checkpoint.updated_unix == 0 && checkpoint.policyfiles.is_empty() {
            return self;
        }
        if checkpoint.attribute_revision_id != self.attributes.revision_id {
            info!(
                previous = ?checkpoint.attribute_revision_id,
                current = ?self.attributes.revision_id,
                "attributes changed since last run; reapplying every policyfile"
            );
            return self;
        }
        let current: BTreeMap<&str, &str> = self
            .policyfiles
            .iter()
            .map(|p| (p.id.as_str(), p.revision_id.as_str()))
            .collect();
        self.applied_policyfile_revision_ids = checkpoint
            .policyfiles
            .into_iter()
            .filter(|(id, _)| current.contains_key(id.as_str()))
            .collect();
        self.resumed = true;
        self
    }

    pub fn directory_path(&self) -> &Path {
        &self.directory_path
    }

    pub fn policyfiles(&self) -> &[PolicyFile] {
        &self.policyfiles
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn applied_policyfile_revision_ids(&self) -> &BTreeMap<String, String> {
        &self.applied_policyfile_revision_ids
    }

    /// Version reported by the tool for the most recent policyfile; empty
    /// until detected.
    pub fn cms_version(&self) -> &str {
        &self.cms_version
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_applied(&self, policyfile: &PolicyFile) -> bool {
        self.applied_policyfile_revision_ids
            .get(&policyfile.id)
            .is_some_and(|rev| rev == &policyfile.revision_id)
    }

    pub fn pending_policyfiles(&self) -> impl Iterator<Item = &PolicyFile> {
        self.policyfiles.iter().filter(|p| !self.is_applied(p))
    }

    /// True when a previous run already applied this exact configuration.
    pub fn is_up_to_date(&self) -> bool {
        self.resumed && self.pending_policyfiles().next().is_none()
    }

    /// Commands that `apply` would run, without touching the filesystem.
    pub fn planned_commands(&self, cms: CmsKind) -> Vec<(PolicyFile, PreparedRun)> {
        self.pending_policyfiles()
            .map(|policyfile| {
                let run = cms::render_command(
                    cms,
                    &self.directory_path,
                    &self.attributes,
                    &policyfile.path(&self.directory_path),
                );
                (policyfile.clone(), run)
            })
            .collect()
    }

    /// Applies pending policyfiles in order, stopping at the first failure.
    pub async fn apply<A>(
        &mut self,
        api: &A,
        runner: &CommandRunner,
        cms: CmsKind,
        workspace: &dyn PolicyWorkspace,
        checkpoint: &dyn CheckpointStore,
    ) -> BootstrapResult<()>
    where
        A: BootstrapApi + ?Sized,
    {
        let policyfiles = self.policyfiles.clone();
        for policyfile in &policyfiles {
            if self.is_applied(policyfile) {
                info!(
                    policyfile = %policyfile.id,
                    revision = %policyfile.revision_id,
                    "policyfile already applied, skipping"
                );
                continue;
            }

            self.cms_version.clear();
            let exit_code = self
                .apply_policyfile(api, runner, cms, workspace, policyfile)
                .await?;
            if exit_code != 0 {
                warn!(
                    policyfile = %policyfile.id,
                    revision = %policyfile.revision_id,
                    exit_code,
                    "policyfile failed"
                );
                return Err(BootstrapError::PolicyfileFailed {
                    policyfile_id: policyfile.id.clone(),
                    revision_id: policyfile.revision_id.clone(),
                    exit_code,
                });
            }

            self.applied_policyfile_revision_ids
                .insert(policyfile.id.clone(), policyfile.revision_id.clone());
            checkpoint
                .save(&self.checkpoint())
                .map_err(|err| BootstrapError::Execution {
                    policyfile_id: policyfile.id.clone(),
                    reason: err.to_string(),
                })?;
            info!(
                policyfile = %policyfile.id,
                revision = %policyfile.revision_id,
                cms_version = %self.cms_version,
                "policyfile applied"
            );
        }
        Ok(())
    }

    async fn apply_policyfile<A>(
        &mut self,
        api: &A,
        runner: &CommandRunner,
        cms: CmsKind,
        workspace: &dyn PolicyWorkspace,
        policyfile: &PolicyFile,
    ) -> BootstrapResult<i32>
    where
        A: BootstrapApi + ?Sized,
    {
        let original_dir = policyfile.path(&self.directory_path);
        if !original_dir.is_dir() {
            return Err(BootstrapError::Execution {
                policyfile_id: policyfile.id.clone(),
                reason: format!("policyfile directory {} not found", original_dir.display()),
            });
        }
        cms::write_inputs(cms, &self.directory_path, &self.attributes, policyfile).map_err(
            |err| BootstrapError::Execution {
                policyfile_id: policyfile.id.clone(),
                reason: err.to_string(),
            },
        )?;

        let policy_dir = match cms {
            CmsKind::Chef => workspace.enter(&self.directory_path, policyfile),
            CmsKind::Ansible => original_dir,
        };
        let prepared = cms::render_command(cms, &self.directory_path, &self.attributes, &policy_dir);
        let runner = match &prepared.working_dir {
            Some(dir) => runner.in_dir(dir),
            None => runner.clone(),
        };

        let mut reporter = BootstrapLogReporter::new(
            api,
            BootstrapRunMetadata {
                run_id: self.run_id.clone(),
                policyfile_id: policyfile.id.clone(),
                policyfile_revision_id: policyfile.revision_id.clone(),
                cms_version: None,
            },
        );
        info!(
            policyfile = %policyfile.id,
            revision = %policyfile.revision_id,
            command = %prepared.command,
            "applying policyfile"
        );
        let result = runner
            .run(
                &prepared.command,
                self.command_timeout,
                Chunking::from_threshold(self.threshold_lines),
                &mut reporter,
            )
            .await;

        if cms == CmsKind::Chef {
            workspace.leave(&self.directory_path, policyfile, &policy_dir);
        }
        if let Some(version) = reporter.cms_version() {
            self.cms_version = version.to_string();
        }

        result.map_err(|err| BootstrapError::Execution {
            policyfile_id: policyfile.id.clone(),
            reason: err.to_string(),
        })
    }

    fn checkpoint(&self) -> AppliedRevisions {
        let mut revisions = AppliedRevisions {
            policyfiles: self.applied_policyfile_revision_ids.clone(),
            attribute_revision_id: self.attributes.revision_id.clone(),
            updated_unix: 0,
        };
        revisions.touch();
        revisions
    }

    pub fn applied_configuration(&self, finished_at: DateTime<Utc>) -> AppliedConfiguration {
        AppliedConfiguration {
            started_at: self.started_at,
            finished_at,
            policyfile_revision_ids: self.applied_policyfile_revision_ids.clone(),
            attribute_revision_id: self.attributes.revision_id.clone(),
        }
    }

    /// Removes the attribute, inventory and variables files. Failures are
    /// logged.
    pub fn cleanup(&self, cms: CmsKind) {
        for path in cms::generated_files(cms, &self.directory_path, &self.attributes) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "cleanup failed"),
            }
        }
    }
}
