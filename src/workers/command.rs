//! Shell command worker.
//!
//! Runs the configured command with `sh -c` in the workspace. The task is
//! passed on stdin and through environment variables:
//! - `TASKMESH_TASK` - task description
//! - `TASKMESH_TASK_ID` - task id
//! - `TASKMESH_CAPABILITIES` - comma separated required capabilities
//! - `TASKMESH_ATTEMPT` - 1-based attempt number

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{TaskInput, WorkerContext, WorkerExecutor, WorkerOutput};
use crate::task::format_capabilities;
use crate::util::{sanitize_output, tail_chars};

/// Max stderr characters carried into an error message.
const STDERR_TAIL_CHARS: usize = 2000;

pub struct CommandExecutor {
    command: String,
    working_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            working_dir,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl WorkerExecutor for CommandExecutor {
    async fn execute(&self, input: TaskInput, ctx: WorkerContext) -> Result<WorkerOutput, String> {
        let working_dir = if ctx.working_dir.as_os_str().is_empty() {
            self.working_dir.clone()
        } else {
            ctx.working_dir.clone()
        };

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&working_dir)
            .env("TASKMESH_TASK", &input.description)
            .env("TASKMESH_TASK_ID", input.task_id.to_string())
            .env("TASKMESH_CAPABILITIES", format_capabilities(&input.capabilities))
            .env("TASKMESH_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn '{}': {}", self.command, e))?;

        // Fed from its own task so a command that never reads stdin cannot
        // block stdout draining. The pipe closes when the writer finishes.
        if let Some(mut stdin) = child.stdin.take() {
            let description = input.description.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(description.as_bytes()).await {
                    tracing::debug!("Worker command did not accept stdin: {}", e);
                }
            });
        }

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(|e| format!("Failed to wait for '{}': {}", self.command, e))?
            }
            _ = ctx.cancel.cancelled() => {
                return Err("cancelled".to_string());
            }
        };

        let stdout = sanitize_output(&output.stdout);
        if !output.status.success() {
            let stderr = sanitize_output(&output.stderr);
            return Err(format!(
                "command exited with {}: {}",
                output.status,
                tail_chars(stderr.trim(), STDERR_TAIL_CHARS)
            ));
        }

        Ok(WorkerOutput::from_raw(&stdout))
    }

    fn describe(&self) -> String {
        format!("command: {}", self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CapabilitySet, TaskId};
    use tokio_util::sync::CancellationToken;

    fn input(description: &str) -> TaskInput {
        TaskInput {
            task_id: TaskId::derive(description, 0),
            description: description.to_string(),
            capabilities: CapabilitySet::new(),
        }
    }

    fn ctx(dir: &std::path::Path) -> WorkerContext {
        WorkerContext {
            working_dir: dir.to_path_buf(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_command_reads_task_from_stdin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exec = CommandExecutor::new("cat; echo; echo 'LEARNING: stdin works'", dir.path().to_path_buf());
        let out = exec.execute(input("write docs"), ctx(dir.path())).await.unwrap();
        assert_eq!(out.output, "write docs");
        assert_eq!(out.learning.as_deref(), Some("stdin works"));
    }

    #[tokio::test]
    async fn test_command_sees_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exec = CommandExecutor::new("echo \"$TASKMESH_ATTEMPT:$TASKMESH_TASK\"", dir.path().to_path_buf());
        let out = exec.execute(input("go"), ctx(dir.path())).await.unwrap();
        assert_eq!(out.output, "1:go");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exec = CommandExecutor::new("echo boom >&2; exit 3", dir.path().to_path_buf());
        let err = exec.execute(input("x"), ctx(dir.path())).await.unwrap_err();
        assert!(err.contains("boom"), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_large_task_with_chatty_command_completes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exec = CommandExecutor::new(
            "head -c 200000 /dev/zero | tr '\\000' a",
            dir.path().to_path_buf(),
        );
        // Larger than a pipe buffer, and never read by the command.
        let description = "x".repeat(100_000);
        let out = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            exec.execute(input(&description), ctx(dir.path())),
        )
        .await
        .expect("command stalled")
        .unwrap();
        assert_eq!(out.output.len(), 200_000);
    }

    #[tokio::test]
    async fn test_cancel_stops_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exec = CommandExecutor::new("sleep 5", dir.path().to_path_buf());
        let context = ctx(dir.path());
        let token = context.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });
        let started = std::time::Instant::now();
        let err = exec.execute(input("x"), context).await.unwrap_err();
        assert_eq!(err, "cancelled");
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }
}
