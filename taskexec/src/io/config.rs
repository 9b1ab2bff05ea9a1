//! Task files: TOML descriptions of a runnable task.
//!
//! A task file names the work, the command-backed agent that performs it, an
//! optional command-backed guardrail, the executor retry policy, and where
//! lifecycle events go. Relative paths resolve against the file's directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::budget::RetryPolicy;
use crate::core::export::{OutputSchema, OutputSpec};
use crate::core::types::OutputFormat;
use crate::execute::ExecuteRequest;
use crate::io::events::{EventEmitter, JsonlSink, TracingSink};
use crate::io::executor::{CommandExecutor, DEFAULT_OUTPUT_LIMIT_BYTES};
use crate::io::guardrail::CommandGuardrail;
use crate::io::persist::validate_output_path;
use crate::task::{Agent, DEFAULT_MAX_RETRIES, Task, Tool};

/// Task file (TOML).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskFile {
    pub task: TaskSection,
    pub agent: Option<AgentSection>,
    pub guardrail: Option<GuardrailSection>,
    pub execution: ExecutionSection,
    pub events: EventsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskSection {
    pub name: Option<String>,
    pub description: String,
    pub expected_output: String,
    /// Guardrail rejections retried before giving up.
    pub max_retries: u32,
    pub output_format: OutputFormat,
    /// JSON Schema file; required for `json` and `typed` formats.
    pub output_schema: Option<PathBuf>,
    /// Defaults to the schema file's stem.
    pub schema_name: Option<String>,
    pub output_file: Option<PathBuf>,
    pub create_directory: bool,
    pub tools: Vec<Tool>,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            name: None,
            description: String::new(),
            expected_output: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            output_format: OutputFormat::Raw,
            output_schema: None,
            schema_name: None,
            output_file: None,
            create_directory: true,
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSection {
    pub role: String,
    /// Argv of the agent command (e.g. `["codex","exec","-"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            role: String::new(),
            command: Vec::new(),
            timeout_secs: 600,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardrailSection {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for GuardrailSection {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionSection {
    pub max_executor_retries: u32,
    pub retry_delay_ms: u64,
    /// Wall-clock budget for the whole run, measured from `build`.
    pub deadline_secs: Option<u64>,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_executor_retries: policy.max_executor_retries,
            retry_delay_ms: u64::try_from(policy.retry_delay.as_millis()).unwrap_or(u64::MAX),
            deadline_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventsSection {
    pub jsonl_path: Option<PathBuf>,
    /// Mirror lifecycle events into the diagnostic log.
    pub log: bool,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            jsonl_path: None,
            log: true,
        }
    }
}

/// Everything needed to run a task file.
#[derive(Debug)]
pub struct BuiltTask {
    pub task: Task,
    pub request: ExecuteRequest,
    pub emitter: EventEmitter,
}

impl TaskFile {
    pub fn validate(&self) -> Result<()> {
        if self.task.description.trim().is_empty() {
            return Err(anyhow!("task.description must not be empty"));
        }
        if self.task.expected_output.trim().is_empty() {
            return Err(anyhow!("task.expected_output must not be empty"));
        }
        if self.task.output_format != OutputFormat::Raw && self.task.output_schema.is_none() {
            return Err(anyhow!(
                "task.output_schema is required for output_format = \"{}\"",
                self.task.output_format.as_str()
            ));
        }
        if let Some(path) = &self.task.output_file {
            validate_output_path(path).context("task.output_file")?;
        }
        if let Some(agent) = &self.agent {
            if agent.role.trim().is_empty() {
                return Err(anyhow!("agent.role must not be empty"));
            }
            if agent.command.is_empty() || agent.command[0].trim().is_empty() {
                return Err(anyhow!("agent.command must be a non-empty array"));
            }
            if agent.timeout_secs == 0 {
                return Err(anyhow!("agent.timeout_secs must be > 0"));
            }
            if agent.output_limit_bytes == 0 {
                return Err(anyhow!("agent.output_limit_bytes must be > 0"));
            }
        }
        if let Some(guardrail) = &self.guardrail {
            if guardrail.command.is_empty() || guardrail.command[0].trim().is_empty() {
                return Err(anyhow!("guardrail.command must be a non-empty array"));
            }
            if guardrail.timeout_secs == 0 {
                return Err(anyhow!("guardrail.timeout_secs must be > 0"));
            }
        }
        if self.execution.deadline_secs == Some(0) {
            return Err(anyhow!("execution.deadline_secs must be > 0"));
        }
        Ok(())
    }

    /// Assemble the task, its execute request, and the event emitter.
    pub fn build(&self, base_dir: &Path) -> Result<BuiltTask> {
        self.validate()?;
        let section = &self.task;

        let mut task = Task::new(section.description.trim(), section.expected_output.trim())
            .with_max_retries(section.max_retries)
            .with_tools(section.tools.clone())
            .with_output_spec(self.output_spec(base_dir)?)
            .with_create_directory(section.create_directory);
        if let Some(name) = &section.name {
            task = task.with_name(name.clone());
        }
        if let Some(path) = &section.output_file {
            task = task.with_output_file(resolve(base_dir, path))?;
        }
        if let Some(agent) = &self.agent {
            let executor = CommandExecutor::new(agent.command.clone())?
                .with_timeout(Duration::from_secs(agent.timeout_secs))
                .with_output_limit_bytes(agent.output_limit_bytes);
            task = task.with_agent(Agent::new(agent.role.clone(), Arc::new(executor)));
        }
        if let Some(guardrail) = &self.guardrail {
            let guardrail = CommandGuardrail::new(guardrail.command.clone())?
                .with_timeout(Duration::from_secs(guardrail.timeout_secs));
            task = task.with_guardrail(guardrail);
        }

        let mut request = ExecuteRequest::default().with_policy(RetryPolicy {
            max_executor_retries: self.execution.max_executor_retries,
            retry_delay: Duration::from_millis(self.execution.retry_delay_ms),
        });
        if let Some(secs) = self.execution.deadline_secs {
            request = request.with_deadline(Instant::now() + Duration::from_secs(secs));
        }

        let mut emitter = EventEmitter::new();
        if self.events.log {
            emitter.add_sink(Arc::new(TracingSink));
        }
        if let Some(path) = &self.events.jsonl_path {
            emitter.add_sink(Arc::new(JsonlSink::new(resolve(base_dir, path))));
        }

        Ok(BuiltTask {
            task,
            request,
            emitter,
        })
    }

    fn output_spec(&self, base_dir: &Path) -> Result<OutputSpec> {
        let section = &self.task;
        let Some(schema_path) = &section.output_schema else {
            return Ok(OutputSpec::Raw);
        };
        let path = resolve(base_dir, schema_path);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let value: Value =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        let name = section
            .schema_name
            .clone()
            .or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().trim_end_matches(".schema").to_string())
            })
            .unwrap_or_else(|| "output".to_string());
        let schema = OutputSchema::new(name, value)
            .with_context(|| format!("compile schema {}", path.display()))?;
        Ok(match section.output_format {
            OutputFormat::Raw => OutputSpec::Raw,
            OutputFormat::Json => OutputSpec::Json(schema),
            OutputFormat::Typed => OutputSpec::Typed(schema),
        })
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Load and validate a task file.
pub fn load_task_file(path: &Path) -> Result<TaskFile> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let file: TaskFile =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    file.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(file)
}
