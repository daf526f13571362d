//! Locating the running agent from a separate `stop` invocation.
//!
//! The contract is a PID file holding the raw decimal PID of the agent
//! followed by a newline. It lives in the system temp directory unless
//! overridden.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{AgentError, AgentResult};

pub const PID_FILE_NAME: &str = "orca-agent.pid";

pub fn default_pid_file() -> PathBuf {
    std::env::temp_dir().join(PID_FILE_NAME)
}

pub trait ProcessHandle: Send + Sync {
    fn register(&self) -> AgentResult<()>;
    fn release(&self) -> AgentResult<()>;
    fn locate(&self) -> AgentResult<Option<u32>>;
}

#[derive(Clone, Debug)]
pub struct PidFileHandle {
    path: PathBuf,
}

impl Default for PidFileHandle {
    fn default() -> Self {
        Self::new(default_pid_file())
    }
}

impl PidFileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProcessHandle for PidFileHandle {
    fn register(&self) -> AgentResult<()> {
        let own = std::process::id();
        match self.locate() {
            Ok(Some(pid)) if pid != own && process_is_running(pid) => {
                return Err(AgentError::ProcessHandle(format!(
                    "agent already running with PID {pid} ({})",
                    self.path.display()
                )));
            }
            Ok(Some(pid)) => debug!(pid, "replacing stale PID file"),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "overwriting unreadable PID file"),
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AgentError::ProcessHandle(format!("{}: {e}", parent.display()))
            })?;
        }
        fs::write(&self.path, format!("{own}\n")).map_err(|e| {
            AgentError::ProcessHandle(format!(
                "failed to write PID file {}: {e}",
                self.path.display()
            ))
        })
    }

    fn release(&self) -> AgentResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::ProcessHandle(format!(
                "failed to remove PID file {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn locate(&self) -> AgentResult<Option<u32>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AgentError::ProcessHandle(format!(
                    "failed to read PID file {}: {e}",
                    self.path.display()
                )))
            }
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => Err(AgentError::ProcessHandle(format!(
                "invalid PID file {}: {:?}",
                self.path.display(),
                raw.trim()
            ))),
        }
    }
}

/// Sends SIGTERM to the agent recorded by `handle` and returns its PID.
pub fn stop_agent<H>(handle: &H) -> AgentResult<u32>
where
    H: ProcessHandle + ?Sized,
{
    let pid = handle.locate()?.ok_or_else(|| {
        AgentError::ProcessHandle("no running agent found (PID file missing)".to_string())
    })?;

    if !process_is_running(pid) {
        handle.release()?;
        return Err(AgentError::ProcessHandle(format!(
            "agent with PID {pid} is not running; removed stale PID file"
        )));
    }

    send_terminate(pid)?;
    Ok(pid)
}

#[cfg(unix)]
pub fn process_is_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence checks only.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_is_running(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> AgentResult<()> {
    let target = libc::pid_t::try_from(pid)
        .map_err(|_| AgentError::ProcessHandle(format!("PID {pid} out of range")))?;
    // SAFETY: kill with a validated positive PID and SIGTERM has no memory effects.
    let result = unsafe { libc::kill(target, libc::SIGTERM) };
    if result == 0 {
        return Ok(());
    }
    Err(AgentError::ProcessHandle(format!(
        "failed to send SIGTERM to PID {pid}: {}",
        std::io::Error::last_os_error()
    )))
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) -> AgentResult<()> {
    Err(AgentError::ProcessHandle(format!(
        "stopping PID {pid} is only supported on unix hosts"
    )))
}
