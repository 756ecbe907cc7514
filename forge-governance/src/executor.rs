//! Command executor collaborator.
//!
//! The engine never runs anything itself; it hands approved actions to a
//! [`CommandExecutor`]. Any result other than `completed` is an execution
//! failure, which is distinct from a rejected action that never ran.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

use crate::action::AutomatedAction;

/// Terminal status reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

/// Outcome of running an action or a replay command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: Vec<String>,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn completed(output: Vec<String>, duration_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            output,
            exit_code: 0,
            duration_ms,
        }
    }

    pub fn failed(output: Vec<String>, exit_code: i32, duration_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output,
            exit_code,
            duration_ms,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Executes actions and rollback replay commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute an approved action.
    async fn execute(&self, action: &AutomatedAction) -> anyhow::Result<ExecutionResult>;

    /// Run a single rollback replay command.
    async fn run_command(&self, command: &str) -> anyhow::Result<ExecutionResult>;
}

/// Deterministic executor used in dry-run mode. Never touches the system.
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl CommandExecutor for DryRunExecutor {
    async fn execute(&self, action: &AutomatedAction) -> anyhow::Result<ExecutionResult> {
        let mut output = vec![format!("[dry-run] {} '{}'", action.kind, action.title)];
        if let Some(command) = &action.command {
            output.push(format!("[dry-run] would run: {}", command));
        }
        Ok(ExecutionResult::completed(output, 0))
    }

    async fn run_command(&self, command: &str) -> anyhow::Result<ExecutionResult> {
        Ok(ExecutionResult::completed(
            vec![format!("[dry-run] would run: {}", command)],
            0,
        ))
    }
}

/// Runs action commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    working_dir: Option<PathBuf>,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: None,
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn run(&self, command: &str) -> anyhow::Result<ExecutionResult> {
        let started = Instant::now();
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::to_string),
        );

        tracing::debug!(command = %command, status = ?output.status, duration_ms, "Command finished");

        if output.status.success() {
            Ok(ExecutionResult::completed(lines, duration_ms))
        } else {
            Ok(ExecutionResult::failed(
                lines,
                output.status.code().unwrap_or(-1),
                duration_ms,
            ))
        }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, action: &AutomatedAction) -> anyhow::Result<ExecutionResult> {
        match &action.command {
            Some(command) => self.run(command).await,
            None => Ok(ExecutionResult::failed(
                vec![format!("action {} has no command to run", action.id)],
                -1,
                0,
            )),
        }
    }

    async fn run_command(&self, command: &str) -> anyhow::Result<ExecutionResult> {
        self.run(command).await
    }
}
