//! Task, agent, and crew types.
//!
//! A [`Task`] carries its identity, configuration, and the mutable
//! [`TaskRunState`] that the controller updates in place. Exclusive `&mut`
//! access is required to execute a task, so two runs can never race on the
//! same retry counter or output.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::export::OutputSpec;
use crate::core::types::{TaskOutput, TaskRef};
use crate::io::executor::Executor;
use crate::io::guardrail::Guardrail;
use crate::io::persist::validate_output_path;

/// Default guardrail retry budget for new tasks.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Completion callback invoked with the accepted output.
///
/// An `Err` (or a panic) fails the attempt like any other attempt error.
pub type TaskCallback = Arc<dyn Fn(&TaskOutput) -> Result<()> + Send + Sync>;

/// Tool made available to an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Group-level settings shared by the agents of a crew.
pub struct Crew {
    name: String,
    task_callback: Option<TaskCallback>,
}

impl Crew {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_callback: None,
        }
    }

    pub fn with_task_callback<F>(self, callback: F) -> Self
    where
        F: Fn(&TaskOutput) -> Result<()> + Send + Sync + 'static,
    {
        self.with_shared_task_callback(Arc::new(callback))
    }

    /// Install a callback that may also be installed on individual tasks.
    pub fn with_shared_task_callback(mut self, callback: TaskCallback) -> Self {
        self.task_callback = Some(callback);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_callback(&self) -> Option<&TaskCallback> {
        self.task_callback.as_ref()
    }
}

impl fmt::Debug for Crew {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crew")
            .field("name", &self.name)
            .field("task_callback", &self.task_callback.is_some())
            .finish()
    }
}

/// An executor bound to a role, optionally belonging to a crew.
#[derive(Clone)]
pub struct Agent {
    role: String,
    executor: Arc<dyn Executor>,
    crew: Option<Arc<Crew>>,
}

impl Agent {
    pub fn new(role: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            role: role.into(),
            executor,
            crew: None,
        }
    }

    pub fn with_crew(mut self, crew: Arc<Crew>) -> Self {
        self.crew = Some(crew);
        self
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub fn crew(&self) -> Option<&Crew> {
        self.crew.as_deref()
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("role", &self.role)
            .field("crew", &self.crew.as_ref().map(|crew| crew.name()))
            .finish_non_exhaustive()
    }
}

/// Mutable bookkeeping owned by a task across attempts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRunState {
    pub(crate) start_time: Option<DateTime<Utc>>,
    pub(crate) end_time: Option<DateTime<Utc>>,
    pub(crate) prompt_context: Option<String>,
    pub(crate) output: Option<TaskOutput>,
    pub(crate) retry_count: u32,
    pub(crate) processed_by_agents: BTreeSet<String>,
    pub(crate) persist_error: Option<String>,
}

impl TaskRunState {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn prompt_context(&self) -> Option<&str> {
        self.prompt_context.as_deref()
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        self.output.as_ref()
    }

    /// Guardrail rejections retried so far. Never exceeds the task's `max_retries`.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn processed_by_agents(&self) -> &BTreeSet<String> {
        &self.processed_by_agents
    }

    /// Last persistence failure, if writing the output file failed.
    pub fn persist_error(&self) -> Option<&str> {
        self.persist_error.as_deref()
    }

    /// Wall-clock time between the latest attempt start and the run's end.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.end_time? - self.start_time?)
    }
}

/// A unit of delegated work.
pub struct Task {
    pub name: Option<String>,
    pub description: String,
    pub expected_output: String,
    pub output_spec: OutputSpec,
    pub agent: Option<Agent>,
    pub tools: Vec<Tool>,
    pub callback: Option<TaskCallback>,
    pub guardrail: Option<Arc<dyn Guardrail>>,
    pub output_file: Option<PathBuf>,
    pub create_directory: bool,
    pub max_retries: u32,
    run: TaskRunState,
}

impl Task {
    pub fn new(description: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            name: None,
            description: description.into(),
            expected_output: expected_output.into(),
            output_spec: OutputSpec::Raw,
            agent: None,
            tools: Vec::new(),
            callback: None,
            guardrail: None,
            output_file: None,
            create_directory: true,
            max_retries: DEFAULT_MAX_RETRIES,
            run: TaskRunState::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_output_spec(mut self, spec: OutputSpec) -> Self {
        self.output_spec = spec;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: Fn(&TaskOutput) -> Result<()> + Send + Sync + 'static,
    {
        self.with_shared_callback(Arc::new(callback))
    }

    /// Install a callback that may also be registered on the agent's crew.
    pub fn with_shared_callback(mut self, callback: TaskCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_guardrail<G: Guardrail + 'static>(self, guardrail: G) -> Self {
        self.with_shared_guardrail(Arc::new(guardrail))
    }

    pub fn with_shared_guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.guardrail = Some(guardrail);
        self
    }

    /// Persist the final output to `path`. Rejects traversal and shell syntax.
    pub fn with_output_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        validate_output_path(path)?;
        self.output_file = Some(path.to_path_buf());
        Ok(self)
    }

    pub fn with_create_directory(mut self, create_directory: bool) -> Self {
        self.create_directory = create_directory;
        self
    }

    pub fn run_state(&self) -> &TaskRunState {
        &self.run
    }

    pub(crate) fn run_state_mut(&mut self) -> &mut TaskRunState {
        &mut self.run
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        self.run.output.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.run.retry_count
    }

    /// Spend one guardrail retry. Returns false once `max_retries` is reached.
    pub(crate) fn consume_guardrail_retry(&mut self) -> bool {
        if self.run.retry_count >= self.max_retries {
            return false;
        }
        self.run.retry_count += 1;
        true
    }

    pub fn reference(&self) -> TaskRef {
        TaskRef {
            name: self.name.clone(),
            description: self.description.clone(),
            agent: self.agent.as_ref().map(|agent| agent.role().to_string()),
            retry_count: self.run.retry_count,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("expected_output", &self.expected_output)
            .field("output_format", &self.output_spec.format())
            .field("agent", &self.agent)
            .field("tools", &self.tools)
            .field("callback", &self.callback.is_some())
            .field("guardrail", &self.guardrail.is_some())
            .field("output_file", &self.output_file)
            .field("max_retries", &self.max_retries)
            .field("run", &self.run)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedExecutor;

    #[test]
    fn new_task_has_default_budget_and_empty_state() {
        let task = Task::new("summarize", "a summary");
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.retry_count(), 0);
        assert!(task.output().is_none());
        assert!(task.run_state().processed_by_agents().is_empty());
        assert!(task.create_directory);
    }

    #[test]
    fn guardrail_retries_stop_at_max() {
        let mut task = Task::new("d", "e").with_max_retries(2);
        assert!(task.consume_guardrail_retry());
        assert!(task.consume_guardrail_retry());
        assert!(!task.consume_guardrail_retry());
        assert_eq!(task.retry_count(), 2);
    }

    #[test]
    fn reference_reports_pinned_agent() {
        let agent = Agent::new("writer", Arc::new(ScriptedExecutor::always_ok("x")));
        let task = Task::new("d", "e").with_name("draft").with_agent(agent);
        let reference = task.reference();
        assert_eq!(reference.name.as_deref(), Some("draft"));
        assert_eq!(reference.agent.as_deref(), Some("writer"));
        assert_eq!(reference.retry_count, 0);
    }

    #[test]
    fn output_file_rejects_traversal() {
        let err = Task::new("d", "e")
            .with_output_file("../outside.txt")
            .expect_err("traversal rejected");
        assert!(err.to_string().contains("path traversal"));
    }

    #[test]
    fn agent_debug_names_crew() {
        let crew = Arc::new(Crew::new("research"));
        let agent =
            Agent::new("writer", Arc::new(ScriptedExecutor::always_ok("x"))).with_crew(crew);
        let rendered = format!("{agent:?}");
        assert!(rendered.contains("writer"));
        assert!(rendered.contains("research"));
    }
}
