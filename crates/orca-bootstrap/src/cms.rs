//! Command lines and input files for the supported configuration-management
//! tools.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use orca_protocol::{Attributes, CmsKind, PolicyFile};
use serde_json::{Map, Value};

use crate::{BootstrapError, BootstrapResult};

pub const LOCAL_POLICY_GROUP: &str = "local";
pub const INVENTORY_FILE_NAME: &str = "inventory";
pub const VARIABLES_FILE_NAME: &str = "variables.json";
pub const ANSIBLE_WRAPPER_SCRIPT: &str = "apply.sh";

const LOCAL_INVENTORY: &str = "[all]\nlocalhost ansible_connection=local\n";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedRun {
    pub command: String,
    /// Directory the shell is started in. `None` when the command changes
    /// directory itself.
    pub working_dir: Option<PathBuf>,
}

/// Attributes handed to `chef-client`, pinned to the local policy group.
pub fn chef_attributes(attributes: &Attributes, policyfile: &PolicyFile) -> Map<String, Value> {
    let mut data = attributes.raw_data.clone();
    data.insert(
        "policy_group".to_string(),
        Value::String(LOCAL_POLICY_GROUP.to_string()),
    );
    data.insert(
        "policy_name".to_string(),
        Value::String(policyfile.id.clone()),
    );
    data
}

/// Builds the command for one policyfile. `policy_dir` is the directory the
/// tool operates on, which may differ from `policyfile.path` while a
/// workspace has it renamed.
pub fn render_command(
    cms: CmsKind,
    directory: &Path,
    attributes: &Attributes,
    policy_dir: &Path,
) -> PreparedRun {
    match cms {
        CmsKind::Chef => PreparedRun {
            command: format!(
                "chef-client -z -j {}",
                quote(&attributes.file_path(directory))
            ),
            working_dir: Some(policy_dir.to_path_buf()),
        },
        CmsKind::Ansible => PreparedRun {
            command: format!(
                "cd {} && sh {} {} {}",
                quote(policy_dir),
                ANSIBLE_WRAPPER_SCRIPT,
                quote(&directory.join(INVENTORY_FILE_NAME)),
                quote(&directory.join(VARIABLES_FILE_NAME)),
            ),
            working_dir: None,
        },
    }
}

/// Writes the files the tool reads for `policyfile`.
pub fn write_inputs(
    cms: CmsKind,
    directory: &Path,
    attributes: &Attributes,
    policyfile: &PolicyFile,
) -> BootstrapResult<()> {
    fs::create_dir_all(directory).map_err(|err| io_error(directory, err))?;
    match cms {
        CmsKind::Chef => write_json(
            &attributes.file_path(directory),
            &chef_attributes(attributes, policyfile),
        ),
        CmsKind::Ansible => {
            let inventory = directory.join(INVENTORY_FILE_NAME);
            fs::write(&inventory, LOCAL_INVENTORY).map_err(|err| io_error(&inventory, err))?;
            write_json(&directory.join(VARIABLES_FILE_NAME), &attributes.raw_data)
        }
    }
}

pub fn generated_files(cms: CmsKind, directory: &Path, attributes: &Attributes) -> Vec<PathBuf> {
    match cms {
        CmsKind::Chef => vec![attributes.file_path(directory)],
        CmsKind::Ansible => vec![
            directory.join(INVENTORY_FILE_NAME),
            directory.join(VARIABLES_FILE_NAME),
        ],
    }
}

fn write_json(path: &Path, data: &Map<String, Value>) -> BootstrapResult<()> {
    let body = serde_json::to_vec_pretty(data).map_err(|err| {
        BootstrapError::Io(format!("failed to encode {}: {err}", path.display()))
    })?;
    fs::write(path, body).map_err(|err| io_error(path, err))
}

fn io_error(path: &Path, err: std::io::Error) -> BootstrapError {
    BootstrapError::Io(format!("{}: {err}", path.display()))
}

fn quote(path: &Path) -> String {
    shell_escape::escape(Cow::Owned(path.to_string_lossy().into_owned())).into_owned()
}
