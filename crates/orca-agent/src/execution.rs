use std::time::Duration;

use orca_protocol::Command;
use orca_runner::{CapturedOutput, Chunking, CommandRunner};
use tracing::{info, warn};

use crate::{AgentResult, Orchestrator};

/// Fetches the pending command, runs it to completion, and reports the result.
///
/// Ad-hoc commands are captured whole and reported once. A runner failure
/// (spawn error, timeout) is still reported, with the failure text as stderr
/// and the runner's synthetic exit code.
pub async fn execute_next_command<O>(
    orchestrator: &O,
    runner: &CommandRunner,
    timeout: Option<Duration>,
) -> AgentResult<Command>
where
    O: Orchestrator + ?Sized,
{
    let mut command = orchestrator.fetch_next_command().await?;
    info!(command_id = %command.id, "executing command");

    let mut capture = CapturedOutput::default();
    match runner
        .run(&command.script, timeout, Chunking::WholeOutput, &mut capture)
        .await
    {
        Ok(exit_code) => command.record_result(capture.into_string(), exit_code),
        Err(err) => {
            warn!(command_id = %command.id, error = %err, "command execution failed");
            let mut output = capture.into_string();
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&err.to_string());
            output.push('\n');
            command.record_result(output, err.exit_code());
        }
    }

    orchestrator.report_command_result(&command).await?;
    info!(
        command_id = %command.id,
        exit_code = command.exit_code,
        "command result reported"
    );
    Ok(command)
}
