use std::path::PathBuf;
use std::process::Stdio;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::process::Command;

use crate::scheduler::{Task, TaskResult};

/// What a successful shell command produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command through `sh -c` on whichever node picks it up.
///
/// A non-zero exit fails the task with stderr (or the exit code when stderr
/// is empty) as the message.
#[derive(Debug, Clone)]
pub struct ShellTask {
    command: String,
    working_dir: Option<PathBuf>,
}

impl ShellTask {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub async fn execute(&self) -> TaskResult {
        tracing::debug!(command = %self.command, "Running shell task");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        Self::process_output(&self.command, cmd.output().await)
    }

    fn process_output(command: &str, result: Result<std::process::Output, std::io::Error>) -> TaskResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                tracing::debug!(command, exit_code = ?exit_code, "Shell task finished");

                if !output.status.success() {
                    return Err(if stderr.trim().is_empty() {
                        format!("Exit code: {:?}", exit_code)
                    } else {
                        stderr.trim_end().to_string()
                    });
                }
                serde_json::to_value(ShellOutput {
                    exit_code,
                    stdout,
                    stderr,
                })
                .map_err(|e| e.to_string())
            }
            Err(e) => {
                tracing::error!(command, error = %e, "Shell task could not be spawned");
                Err(e.to_string())
            }
        }
    }
}

impl Task for ShellTask {
    fn run(&self) -> BoxFuture<'static, TaskResult> {
        let task = self.clone();
        Box::pin(async move { task.execute().await })
    }

    fn describe(&self) -> String {
        self.command.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_command_captures_stdout() {
        let value = ShellTask::new("echo hello").execute().await.unwrap();
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["stdout"], "hello\n");
    }

    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let err = ShellTask::new("echo oops >&2; exit 3").execute().await.unwrap_err();
        assert_eq!(err, "oops");
    }

    #[tokio::test]
    async fn test_silent_failure_reports_exit_code() {
        let err = ShellTask::new("exit 4").execute().await.unwrap_err();
        assert_eq!(err, "Exit code: Some(4)");
    }

    #[tokio::test]
    async fn test_working_dir() {
        let value = ShellTask::new("pwd").in_dir("/").execute().await.unwrap();
        assert_eq!(value["stdout"], "/\n");
    }

    #[test]
    fn test_describe_is_the_command() {
        assert_eq!(ShellTask::new("ls -la").describe(), "ls -la");
    }
}
