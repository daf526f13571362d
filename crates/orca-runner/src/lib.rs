//! Shell command execution with incremental, chunked output delivery.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

mod chunk;

pub use chunk::{ChunkBuffer, Chunking};

pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;
pub const TIMEOUT_EXIT_CODE: i32 = 124;
pub const GENERIC_FAILURE_EXIT_CODE: i32 = 1;

const LINE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start command: {0}")]
    Spawn(String),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("chunk delivery rejected: {0}")]
    ChunkRejected(String),
    #[error("io failure: {0}")]
    Io(String),
}

impl RunnerError {
    /// Synthetic exit code reported when no real one exists.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Spawn(_) => SPAWN_FAILURE_EXIT_CODE,
            Self::Timeout(_) => TIMEOUT_EXIT_CODE,
            Self::ChunkRejected(_) | Self::Io(_) => GENERIC_FAILURE_EXIT_CODE,
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ChunkRejected(pub String);

/// Receives output chunks while a command is still running. Returning an
/// error aborts the command.
#[async_trait]
pub trait ChunkSink: Send {
    async fn deliver(&mut self, chunk: String) -> Result<(), ChunkRejected>;
}

/// Sink that keeps every chunk in memory.
#[derive(Clone, Debug, Default)]
pub struct CapturedOutput {
    text: String,
    deliveries: usize,
}

impl CapturedOutput {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn deliveries(&self) -> usize {
        self.deliveries
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

#[async_trait]
impl ChunkSink for CapturedOutput {
    async fn deliver(&mut self, chunk: String) -> Result<(), ChunkRejected> {
        self.text.push_str(&chunk);
        self.deliveries += 1;
        Ok(())
    }
}

/// Negative or zero seconds mean "no timeout".
pub fn timeout_from_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs)
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shell {
    Sh,
    Cmd,
}

impl Shell {
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Cmd
        } else {
            Self::Sh
        }
    }

    fn command(self, script: &str) -> Command {
        let (program, flag) = match self {
            Self::Sh => ("sh", "-c"),
            Self::Cmd => ("cmd", "/C"),
        };
        let mut cmd = Command::new(program);
        cmd.arg(flag).arg(script);
        cmd
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::host()
    }
}

#[derive(Clone, Debug, Default)]
pub struct CommandRunner {
    shell: Shell,
    working_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: Shell) -> Self {
        self.shell = shell;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Returns a copy of this runner that starts commands in `dir`.
    pub fn in_dir(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
            ..self.clone()
        }
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Runs `command` through the host shell, folding stderr into stdout, and
    /// feeds `sink` with chunks as they fill up. Returns the child's exit code.
    pub async fn run<S>(
        &self,
        command: &str,
        timeout: Option<Duration>,
        chunking: Chunking,
        sink: &mut S,
    ) -> RunnerResult<i32>
    where
        S: ChunkSink + ?Sized,
    {
        let mut cmd = self.shell.command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{command}: {e}")))?;
        debug!(pid = child.id(), ?timeout, ?chunking, "command started");

        let (tx, mut rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let deadline = timeout.map(|limit| (Instant::now() + limit, limit));
        let mut buffer = ChunkBuffer::new(chunking);

        loop {
            let line = tokio::select! {
                line = rx.recv() => line,
                limit = wait_for(deadline) => {
                    terminate(&mut child).await;
                    return Err(RunnerError::Timeout(limit));
                }
            };
            let Some(line) = line else {
                break;
            };
            if let Some(chunk) = buffer.push(&line) {
                if let Err(rejected) = sink.deliver(chunk).await {
                    terminate(&mut child).await;
                    return Err(RunnerError::ChunkRejected(rejected.0));
                }
            }
        }

        if let Some(chunk) = buffer.flush() {
            if let Err(rejected) = sink.deliver(chunk).await {
                terminate(&mut child).await;
                return Err(RunnerError::ChunkRejected(rejected.0));
            }
        }

        let status = match deadline {
            Some((at, limit)) => match tokio::time::timeout_at(at, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    terminate(&mut child).await;
                    return Err(RunnerError::Timeout(limit));
                }
            },
            None => child.wait().await,
        }
        .map_err(|e| RunnerError::Io(format!("wait failed: {e}")))?;

        let exit_code = exit_code_of(status);
        debug!(exit_code, "command finished");
        Ok(exit_code)
    }
}

async fn wait_for(deadline: Option<(Instant, Duration)>) -> Duration {
    match deadline {
        Some((at, limit)) => {
            tokio::time::sleep_until(at).await;
            limit
        }
        None => std::future::pending().await,
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                // A final fragment without a newline is forwarded as written.
                let line = String::from_utf8_lossy(&raw).into_owned();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "output stream read failed");
                break;
            }
        }
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // SAFETY: killpg only sends a signal to the process group created for
        // this child; it touches no memory.
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "child already exited");
    }
    if let Err(err) = child.wait().await {
        warn!(error = %err, "failed to reap killed child");
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    GENERIC_FAILURE_EXIT_CODE
}
