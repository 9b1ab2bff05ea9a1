//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the controller from the agent backend.
//! [`CommandExecutor`] pipes a rendered prompt into an external command; tests
//! use scripted executors that return predetermined outputs without spawning
//! processes.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::io::prompt::PromptEngine;
use crate::task::{Task, Tool};

pub const DEFAULT_EXECUTOR_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Abstraction over agent execution backends.
pub trait Executor: Send + Sync {
    /// Run the task once and return the agent's raw text answer.
    ///
    /// `context` is the prompt context for this attempt (caller-provided, or
    /// the validation message after a guardrail rejection).
    fn run(&self, task: &Task, context: Option<&str>, tools: &[Tool]) -> Result<String>;
}

/// Executor that spawns a configured command and feeds it the task prompt on stdin.
#[derive(Debug)]
pub struct CommandExecutor {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    prompts: PromptEngine,
}

impl CommandExecutor {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("executor command must be a non-empty array"));
        }
        Ok(Self {
            command,
            timeout: DEFAULT_EXECUTOR_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            prompts: PromptEngine::new()?,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output_limit_bytes(mut self, output_limit_bytes: usize) -> Self {
        self.output_limit_bytes = output_limit_bytes;
        self
    }

    fn program(&self) -> &str {
        self.command.first().map_or("", String::as_str)
    }
}

impl Executor for CommandExecutor {
    #[instrument(skip_all, fields(program = self.program(), timeout_secs = self.timeout.as_secs()))]
    fn run(&self, task: &Task, context: Option<&str>, tools: &[Tool]) -> Result<String> {
        let prompt = self
            .prompts
            .render_task(task, context, tools)
            .context("render task prompt")?;
        info!(prompt_bytes = prompt.len(), "starting executor command");

        let cmd = command_from_argv(&self.command)?;
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run executor command {}", self.program()))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "executor timed out");
            return Err(anyhow!("executor timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(exit_code = ?output.status.code(), "executor failed");
            return Err(anyhow!(
                "executor failed with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }

        let raw = output.stdout_lossy().trim().to_string();
        if raw.is_empty() {
            return Err(anyhow!("executor produced no output"));
        }
        debug!(raw_bytes = raw.len(), "executor completed");
        Ok(raw)
    }
}
