//! Executor that runs an external agent program per attempt.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use conductor_core::{ExecutionContext, ExecutionError, Executor, TaskOutput};
use tokio::process::Command;
use tracing::debug;

/// Spawns `program args.. <instruction>`.
///
/// A string `cwd` in the task context becomes the working directory. The
/// child is killed when the attempt is cancelled. Stdout is the task
/// output; stderr lines are kept as logs.
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        instruction: &str,
        ctx: ExecutionContext,
    ) -> Result<TaskOutput, ExecutionError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(instruction)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = ctx.context.get("cwd").and_then(|v| v.as_str()) {
            command.current_dir(cwd);
        }

        let child = command.spawn().map_err(|e| {
            ExecutionError::new(format!("failed to spawn {}: {e}", self.program.display()))
                .with_code("SPAWN")
        })?;
        debug!(task_id = %ctx.task_id, attempt = ctx.attempt, pid = child.id(), "agent spawned");
        ctx.progress.report("agent started");

        // dropping the pending wait kills the child (kill_on_drop)
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| {
                ExecutionError::new(format!("failed to wait for agent: {e}"))
            })?,
            _ = ctx.cancel.cancelled() => {
                return Err(ExecutionError::new("agent was cancelled")
                    .with_code(ExecutionError::CANCELLED));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let logs: Vec<String> = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::to_string)
            .collect();

        if output.status.success() {
            return Ok(TaskOutput::new(stdout).with_logs(logs));
        }
        let code = output
            .status
            .code()
            .map(|c| format!("EXIT_{c}"))
            .unwrap_or_else(|| "SIGNALED".to_string());
        let message = logs
            .last()
            .cloned()
            .unwrap_or_else(|| format!("agent exited with {}", output.status));
        Err(ExecutionError::new(message).with_code(code).with_logs(logs))
    }

    fn name(&self) -> &str {
        "command"
    }
}
