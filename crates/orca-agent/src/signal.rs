use std::fmt;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AgentError, AgentResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Registered handlers for the interceptable termination signals.
pub struct ShutdownListener {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownListener {
    /// Must be called inside a tokio runtime.
    pub fn install() -> AgentResult<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let interrupt = signal(SignalKind::interrupt())
                .map_err(|e| AgentError::Signal(format!("SIGINT handler: {e}")))?;
            let terminate = signal(SignalKind::terminate())
                .map_err(|e| AgentError::Signal(format!("SIGTERM handler: {e}")))?;
            Ok(Self {
                interrupt,
                terminate,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
                _ = self.terminate.recv() => ShutdownSignal::Terminate,
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "ctrl-c listener failed");
                std::future::pending::<()>().await;
            }
            ShutdownSignal::Interrupt
        }
    }
}

/// Cancels `cancel` on the first termination signal. The task also exits
/// quietly if `cancel` is triggered by someone else.
pub fn spawn_signal_handler(cancel: CancellationToken) -> AgentResult<JoinHandle<()>> {
    let mut listener = ShutdownListener::install()?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => debug!("signal handler released"),
            received = listener.recv() => {
                info!(signal = %received, "shutdown signal received");
                cancel.cancel();
            }
        }
    }))
}

/// Waits for a task from [`spawn_signal_handler`]. Returns `false` when the
/// task panicked or was aborted.
pub async fn join_signal_handler(task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "signal handler task ended abnormally");
            false
        }
    }
}
