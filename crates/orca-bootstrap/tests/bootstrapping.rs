#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use orca_bootstrap::{
    BootstrapApi, BootstrapError, BootstrapSettings, Bootstrapper, BootstrappingProcess,
    ConfigurationSource, CycleOutcome, InPlaceWorkspace, Schedule,
};
use orca_checkpoint::{
    AppliedRevisions, CheckpointError, CheckpointStore, JsonFileCheckpointStore,
    MemoryCheckpointStore,
};
use orca_protocol::{
    AppliedConfiguration, Attributes, BootstrapConfiguration, BootstrapLogChunk, CmsKind,
    PolicyFile, RemoteError, RemoteResult,
};
use orca_runner::CommandRunner;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingApi {
    configuration: Option<BootstrapConfiguration>,
    chunks: Mutex<Vec<BootstrapLogChunk>>,
    applied: Mutex<Vec<AppliedConfiguration>>,
}

impl RecordingApi {
    fn serving(configuration: BootstrapConfiguration) -> Self {
        Self {
            configuration: Some(configuration),
            ..Self::default()
        }
    }

    fn chunks(&self) -> Vec<BootstrapLogChunk> {
        self.chunks.lock().expect("lock").clone()
    }

    fn chunks_for(&self, policyfile_id: &str) -> Vec<BootstrapLogChunk> {
        self.chunks()
            .into_iter()
            .filter(|c| c.metadata.policyfile_id == policyfile_id)
            .collect()
    }

    fn output_for(&self, policyfile_id: &str) -> String {
        self.chunks_for(policyfile_id)
            .iter()
            .map(|c| c.stdout.as_str())
            .collect()
    }

    fn applied(&self) -> Vec<AppliedConfiguration> {
        self.applied.lock().expect("lock").clone()
    }
}

#[async_trait]
impl BootstrapApi for RecordingApi {
    async fn fetch_bootstrap_configuration(&self) -> RemoteResult<BootstrapConfiguration> {
        self.configuration.clone().ok_or(RemoteError::Status {
            status: 404,
            body: "no configuration".to_string(),
        })
    }

    async fn report_bootstrap_log_chunk(&self, chunk: &BootstrapLogChunk) -> RemoteResult<()> {
        self.chunks.lock().expect("lock").push(chunk.clone());
        Ok(())
    }

    async fn report_applied_configuration(
        &self,
        applied: &AppliedConfiguration,
    ) -> RemoteResult<()> {
        self.applied.lock().expect("lock").push(applied.clone());
        Ok(())
    }
}

struct FailingUploadApi;

#[async_trait]
impl BootstrapApi for FailingUploadApi {
    async fn fetch_bootstrap_configuration(&self) -> RemoteResult<BootstrapConfiguration> {
        Err(RemoteError::Transport("offline".to_string()))
    }

    async fn report_bootstrap_log_chunk(&self, _chunk: &BootstrapLogChunk) -> RemoteResult<()> {
        Err(RemoteError::Transport("offline".to_string()))
    }

    async fn report_applied_configuration(
        &self,
        _applied: &AppliedConfiguration,
    ) -> RemoteResult<()> {
        Err(RemoteError::Transport("offline".to_string()))
    }
}

/// Creates `<base>/<id>-<rev>/apply.sh` with `body`.
fn stage(base: &Path, id: &str, rev: &str, body: &str) {
    let dir = PolicyFile::new(id, rev).path(base);
    fs::create_dir_all(&dir).expect("create policy dir");
    fs::write(dir.join("apply.sh"), body).expect("write apply.sh");
}

fn configuration(policyfiles: &[(&str, &str)]) -> BootstrapConfiguration {
    let mut raw_data = Map::new();
    raw_data.insert("role".to_string(), Value::from("db"));
    BootstrapConfiguration {
        policyfiles: policyfiles
            .iter()
            .map(|(id, rev)| PolicyFile::new(*id, *rev))
            .collect(),
        attributes: Attributes {
            revision_id: Some("attrs-1".to_string()),
            raw_data,
        },
    }
}

#[tokio::test]
async fn failure_stops_the_sequence_and_keeps_earlier_progress() {
    let dir = tempfile::tempdir().expect("tempdir");
    stage(dir.path(), "a", "r1", "echo applying a\n");
    stage(dir.path(), "b", "r1", "echo applying b\nexit 3\n");
    stage(dir.path(), "c", "r1", "echo applying c\n");
    let api = RecordingApi::default();
    let store = MemoryCheckpointStore::default();

    let mut process = BootstrappingProcess::new(
        dir.path(),
        configuration(&[("a", "r1"), ("b", "r1"), ("c", "r1")]),
        10,
    );
    let err = process
        .apply(
            &api,
            &CommandRunner::new(),
            CmsKind::Ansible,
            &InPlaceWorkspace,
            &store,
        )
        .await
        .expect_err("second policyfile fails");

    match &err {
        BootstrapError::PolicyfileFailed {
            policyfile_id,
            revision_id,
            exit_code,
        } => {
            assert_eq!(policyfile_id, "b");
            assert_eq!(revision_id, "r1");
            assert_eq!(*exit_code, 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.failed_policyfile(), Some("b"));
    assert_eq!(
        process
            .applied_policyfile_revision_ids()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<Vec<_>>(),
        vec![("a", "r1")]
    );
    assert_eq!(api.output_for("b"), "applying b\n");
    assert!(api.chunks_for("c").is_empty());
    assert_eq!(
        store.snapshot().policyfiles.get("a").map(String::as_str),
        Some("r1")
    );
    assert!(!store.snapshot().policyfiles.contains_key("b"));
}

#[tokio::test]
async fn retry_resumes_after_the_last_applied_policyfile() {
    let dir = tempfile::tempdir().expect("tempdir");
    stage(dir.path(), "a", "r1", "echo applying a\n");
    stage(dir.path(), "b", "r1", "exit 1\n");
    let store = MemoryCheckpointStore::default();
    let config = configuration(&[("a", "r1"), ("b", "r1")]);

    let first = RecordingApi::default();
    let mut process = BootstrappingProcess::new(dir.path(), config.clone(), 10);
    assert!(process
        .apply(&first, &CommandRunner::new(), CmsKind::Ansible, &InPlaceWorkspace, &store)
        .await
        .is_err());

    stage(dir.path(), "b", "r1", "echo applying b\n");
    let second = RecordingApi::default();
    let mut process = BootstrappingProcess::new(dir.path(), config, 10)
        .resume_from(store.load().expect("load checkpoint"));
    process
        .apply(&second, &CommandRunner::new(), CmsKind::Ansible, &InPlaceWorkspace, &store)
        .await
        .expect("retry succeeds");

    assert!(second.chunks_for("a").is_empty());
    assert_eq!(second.output_for("b"), "applying b\n");
    assert_eq!(process.applied_policyfile_revision_ids().len(), 2);
}

#[tokio::test]
async fn output_is_uploaded_in_threshold_chunks_with_run_metadata() {
    let dir = tempfile::tempdir().expect("tempdir");
    stage(
        dir.path(),
        "a",
        "r1",
        "for i in 1 2 3 4 5; do echo line $i; done\n",
    );
    let api = RecordingApi::default();

    let mut process = BootstrappingProcess::new(dir.path(), configuration(&[("a", "r1")]), 2);
    process
        .apply(
            &api,
            &CommandRunner::new(),
            CmsKind::Ansible,
            &InPlaceWorkspace,
            &MemoryCheckpointStore::default(),
        )
        .await
        .expect("apply");

    let chunks = api.chunks();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].stdout, "line 1\nline 2\n");
    assert_eq!(chunks[2].stdout, "line 5\n");
    for chunk in &chunks {
        assert_eq!(chunk.metadata.run_id, process.run_id());
        assert_eq!(chunk.metadata.policyfile_id, "a");
        assert_eq!(chunk.metadata.policyfile_revision_id, "r1");
    }
}

#[tokio::test]
async fn ansible_wrapper_receives_inventory_and_variables() {
    let dir = tempfile::tempdir().expect("tempdir");
    stage(
        dir.path(),
        "db",
        "r4",
        "echo \"cwd=$(basename \"$(pwd)\")\"\ncat \"$1\"\ncat \"$2\"\n",
    );
    let api = RecordingApi::default();

    let mut process = BootstrappingProcess::new(dir.path(), configuration(&[("db", "r4")]), 0);
    process
        .apply(
            &api,
            &CommandRunner::new(),
            CmsKind::Ansible,
            &InPlaceWorkspace,
            &MemoryCheckpointStore::default(),
        )
        .await
        .expect("apply");

    let output = api.output_for("db");
    assert_eq!(api.chunks().len(), 1, "threshold 0 uploads once");
    assert!(output.contains("cwd=db-r4"));
    assert!(output.contains("localhost ansible_connection=local"));
    assert!(output.contains("\"role\": \"db\""));
}

#[tokio::test]
async fn chef_runs_in_policy_dir_with_pinned_attributes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bin = dir.path().join("bin");
    fs::create_dir_all(&bin).expect("bin dir");
    let chef = bin.join("chef-client");
    fs::write(
        &chef,
        "#!/bin/sh\necho \"Starting Chef Infra Client, version 18.4.2\"\necho \"cwd=$(basename \"$(pwd)\")\"\ncat \"$3\"\n",
    )
    .expect("write chef-client");
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&chef, fs::Permissions::from_mode(0o755)).expect("chmod");
    }
    let base = dir.path().join("policies");
    fs::create_dir_all(PolicyFile::new("web", "r1").path(&base)).expect("policy dir");

    let path = format!(
        "{}:{}",
        bin.display(),
        std::env::var("PATH").unwrap_or_default()
    );
    let runner = CommandRunner::new().env("PATH", path);
    let api = RecordingApi::default();
    let mut process = BootstrappingProcess::new(&base, configuration(&[("web", "r1")]), 100);
    process
        .apply(&api, &runner, CmsKind::Chef, &InPlaceWorkspace, &MemoryCheckpointStore::default())
        .await
        .expect("apply");

    let output = api.output_for("web");
    assert!(output.contains("cwd=web-r1"));
    assert!(output.contains("\"policy_group\": \"local\""));
    assert!(output.contains("\"policy_name\": \"web\""));
    assert_eq!(process.cms_version(), "18.4.2");
    assert_eq!(
        api.chunks()[0].metadata.cms_version.as_deref(),
        Some("18.4.2")
    );
}

#[tokio::test]
async fn cms_version_does_not_leak_between_policyfiles() {
    let dir = tempfile::tempdir().expect("tempdir");
    stage(dir.path(), "a", "r1", "echo 'ansible-playbook [core 2.15.3]'\n");
    stage(dir.path(), "b", "r1", "echo quiet\n");
    let api = RecordingApi::default();

    let mut process =
        BootstrappingProcess::new(dir.path(), configuration(&[("a", "r1"), ("b", "r1")]), 1);
    process
        .apply(
            &api,
            &CommandRunner::new(),
            CmsKind::Ansible,
            &InPlaceWorkspace,
            &MemoryCheckpointStore::default(),
        )
        .await
        .expect("apply");

    assert_eq!(
        api.chunks_for("a")[0].metadata.cms_version.as_deref(),
        Some("2.15.3")
    );
    assert_eq!(api.chunks_for("b")[0].metadata.cms_version, None);
    assert_eq!(process.cms_version(), "");
}

#[tokio::test]
async fn missing_policy_directory_is_an_execution_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut process = BootstrappingProcess::new(dir.path(), configuration(&[("gone", "r1")]), 10);
    let err = process
        .apply(
            &RecordingApi::default(),
            &CommandRunner::new(),
            CmsKind::Ansible,
            &InPlaceWorkspace,
            &MemoryCheckpointStore::default(),
        )
        .await
        .expect_err("directory missing");

    assert!(matches!(err, BootstrapError::Execution { .. }));
    assert_eq!(err.failed_policyfile(), Some("gone"));
}

#[tokio::test]
async fn rejected_upload_aborts_the_policyfile() {
    let dir = tempfile::tempdir().expect("tempdir");
    stage(dir.path(), "a", "r1", "echo one\necho two\n");
    let store = MemoryCheckpointStore::default();

    let mut process = BootstrappingProcess::new(dir.path(), configuration(&[("a", "r1")]), 1);
    let err = process
        .apply(
            &FailingUploadApi,
            &CommandRunner::new(),
            CmsKind::Ansible,
            &InPlaceWorkspace,
            &store,
        )
        .await
        .expect_err("upload failure aborts");

    assert!(matches!(err, BootstrapError::Execution { .. }));
    assert!(store.snapshot().policyfiles.is_empty());
}

/// Loads nothing and refuses every save.
struct ReadOnlyStore;

impl CheckpointStore for ReadOnlyStore {
    fn load(&self) -> Result<AppliedRevisions, CheckpointError> {
        Ok(AppliedRevisions::default())
    }

    fn save(&self, _revisions: &AppliedRevisions) -> Result<(), CheckpointError> {
        Err(CheckpointError::Write("read-only filesystem".to_string()))
    }
}

#[tokio::test]
async fn unwritable_inputs_name_the_policyfile() {
    let dir = tempfile::tempdir().expect("tempdir");
    stage(dir.path(), "a", "r1", "echo applying a\n");
    stage(dir.path(), "b", "r1", "echo applying b\n");
    fs::create_dir_all(dir.path().join("variables.json")).expect("blocking dir");
    let api = RecordingApi::default();

    let mut process =
        BootstrappingProcess::new(dir.path(), configuration(&[("a", "r1"), ("b", "r1")]), 10);
    let err = process
        .apply(
            &api,
            &CommandRunner::new(),
            CmsKind::Ansible,
            &InPlaceWorkspace,
            &MemoryCheckpointStore::default(),
        )
        .await
        .expect_err("variables file cannot be written");

    assert!(matches!(err, BootstrapError::Execution { .. }));
    assert_eq!(err.failed_policyfile(), Some("a"));
    assert!(err.to_string().contains("variables.json"));
    assert!(api.chunks().is_empty());
    assert!(process.applied_policyfile_revision_ids().is_empty());
}

#[tokio::test]
async fn checkpoint_save_failure_names_the_policyfile() {
    let dir = tempfile::tempdir().expect("tempdir");
    stage(dir.path(), "a", "r1", "echo applying a\n");
    stage(dir.path(), "b", "r1", "echo applying b\n");
    let api = RecordingApi::default();

    let mut process =
        BootstrappingProcess::new(dir.path(), configuration(&[("a", "r1"), ("b", "r1")]), 10);
    let err = process
        .apply(
            &api,
            &CommandRunner::new(),
            CmsKind::Ansible,
            &InPlaceWorkspace,
            &ReadOnlyStore,
        )
        .await
        .expect_err("checkpoint cannot be saved");

    assert!(matches!(err, BootstrapError::Execution { .. }));
    assert_eq!(err.failed_policyfile(), Some("a"));
    assert!(err.to_string().contains("read-only filesystem"));
    assert_eq!(api.output_for("a"), "applying a\n");
    assert!(api.chunks_for("b").is_empty());
}

fn bootstrapper(base: &Path, api: RecordingApi, cleanup: bool) -> Bootstrapper<RecordingApi> {
    let mut settings = BootstrapSettings::new(base, CmsKind::Ansible);
    settings.cleanup = cleanup;
    Bootstrapper::new(
        api,
        CommandRunner::new(),
        Box::new(InPlaceWorkspace),
        Box::new(JsonFileCheckpointStore::new(base.join("applied-revisions.json"))),
        settings,
    )
}

#[tokio::test]
async fn cycle_reports_applied_configuration_then_skips() {
    let dir = tempfile::tempdir().expect("tempdir");
    stage(dir.path(), "a", "r1", "echo a\n");
    stage(dir.path(), "b", "r2", "echo b\n");
    let bootstrapper = bootstrapper(
        dir.path(),
        RecordingApi::serving(configuration(&[("a", "r1"), ("b", "r2")])),
        true,
    );

    let outcome = bootstrapper
        .run_cycle(&ConfigurationSource::Remote)
        .await
        .expect("first cycle");
    assert_eq!(outcome, CycleOutcome::Applied { policyfiles: 2 });

    let applied = bootstrapper.api().applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(
        applied[0].policyfile_revision_ids.get("b").map(String::as_str),
        Some("r2")
    );
    assert_eq!(applied[0].attribute_revision_id.as_deref(), Some("attrs-1"));
    assert!(applied[0].finished_at >= applied[0].started_at);
    assert!(!dir.path().join("inventory").exists(), "cleanup removes inputs");
    assert!(!dir.path().join("variables.json").exists());

    let chunks_after_first = bootstrapper.api().chunks().len();
    let outcome = bootstrapper
        .run_cycle(&ConfigurationSource::Remote)
        .await
        .expect("second cycle");
    assert_eq!(outcome, CycleOutcome::AlreadyApplied);
    assert_eq!(bootstrapper.api().chunks().len(), chunks_after_first);
    assert_eq!(bootstrapper.api().applied().len(), 1);
}

#[tokio::test]
async fn new_revision_is_applied_on_the_next_cycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    stage(dir.path(), "a", "r1", "echo a1\n");
    stage(dir.path(), "a", "r2", "echo a2\n");
    let bootstrapper = bootstrapper(dir.path(), RecordingApi::default(), false);

    let first = ConfigurationSource::Inline(configuration(&[("a", "r1")]));
    bootstrapper.run_cycle(&first).await.expect("first cycle");
    let second = ConfigurationSource::Inline(configuration(&[("a", "r2")]));
    let outcome = bootstrapper.run_cycle(&second).await.expect("second cycle");

    assert_eq!(outcome, CycleOutcome::Applied { policyfiles: 1 });
    assert_eq!(bootstrapper.api().output_for("a"), "a1\na2\n");
    assert!(dir.path().join("variables.json").exists());
}

#[tokio::test]
async fn continuous_mode_keeps_going_after_failures_until_cancelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bootstrapper = bootstrapper(dir.path(), RecordingApi::default(), false);
    let cancel = CancellationToken::new();

    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            cancel.cancel();
        })
    };
    let cycles = tokio::time::timeout(
        Duration::from_secs(5),
        bootstrapper.run_continuously(
            &ConfigurationSource::Remote,
            Schedule {
                interval: Duration::from_millis(40),
                splay: Duration::from_millis(10),
            },
            cancel,
        ),
    )
    .await
    .expect("loop stops after cancel");
    stopper.await.expect("stopper");

    assert!(cycles >= 2, "failed fetches do not stop the loop: {cycles}");
}
