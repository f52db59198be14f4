use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::ExecConfig;
use crate::protocol::Task;

/// Outcome of one execute phase. Never an error at the protocol level;
/// failures are captured into the result payload.
#[derive(Debug)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn ok(&self) -> bool {
        !self.timed_out && self.error.is_none() && self.exit_code == Some(0)
    }

    /// Opaque result payload for `taskCompleted`.
    pub fn to_value(&self) -> Value {
        json!({
            "ok": self.ok(),
            "exitCode": self.exit_code,
            "stdout": self.stdout,
            "stderr": self.stderr,
            "error": self.error,
            "timedOut": self.timed_out,
            "durationMs": self.duration.as_millis() as u64,
        })
    }
}

/// Runs a task's entry point through the configured interpreter inside its
/// workspace, with the task's env/args and timeout.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    config: ExecConfig,
}

impl TaskExecutor {
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }

    pub async fn execute(&self, task: &Task, dir: &Path) -> ExecutionResult {
        let timeout = task
            .payload
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);

        tracing::info!(
            task_id = %task.task_id,
            entry_point = %task.payload.entry_point,
            interpreter = %self.config.interpreter,
            timeout_ms = timeout.as_millis() as u64,
            "Executing task"
        );

        let started = Instant::now();
        let mut command = Command::new(&self.config.interpreter);
        command
            .arg(&task.payload.entry_point)
            .args(&task.payload.args)
            .envs(&task.payload.env)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, command.output()).await {
            Err(_) => {
                tracing::warn!(task_id = %task.task_id, "Task execution timed out");
                ExecutionResult {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(format!("timed out after {}ms", timeout.as_millis())),
                    timed_out: true,
                    duration: started.elapsed(),
                }
            }
            Ok(Err(e)) => {
                tracing::error!(task_id = %task.task_id, error = %e, "Failed to spawn task");
                ExecutionResult {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(e.to_string()),
                    timed_out: false,
                    duration: started.elapsed(),
                }
            }
            Ok(Ok(output)) => {
                let exit_code = output.status.code();
                let result = ExecutionResult {
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    error: None,
                    timed_out: false,
                    duration: started.elapsed(),
                };
                tracing::info!(
                    task_id = %task.task_id,
                    exit_code = ?exit_code,
                    ok = result.ok(),
                    "Task execution finished"
                );
                result
            }
        }
    }
}
