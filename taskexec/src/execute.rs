//! Orchestration for a single task execution.
//!
//! One [`TaskExecutionController::execute`] call drives a task through as
//! many attempts as its two budgets allow:
//!
//! - **Guardrail retries**: a rejected output restarts the attempt with the
//!   rejection rendered into the prompt context. Bounded by `task.max_retries`
//!   and counted on the task itself, so the count survives executor retries.
//! - **Executor retries**: any retryable [`TaskError`] ends the attempt, emits
//!   `Failed`, waits `retry_delay`, and restarts. Bounded by
//!   [`RetryPolicy::max_executor_retries`], fresh for every call.
//!
//! When both are spent (or the error is terminal) the run returns a failure
//! sentinel output instead of an error. The only `Err` is a missing agent.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::core::budget::{RetryPolicy, ensure_may_continue, wait_for_retry};
use crate::core::error::{FailureKind, TaskError};
use crate::core::export::OutputExporter;
use crate::core::types::{AcceptedOutput, ExecutionEvent, GuardrailOutcome, TaskOutput};
use crate::io::events::EventEmitter;
use crate::io::guardrail::GuardrailValidator;
use crate::io::persist::{OutputPersister, select_content};
use crate::io::prompt::PromptEngine;
use crate::task::{Agent, Crew, Task, TaskCallback, Tool};

/// Per-call parameters for [`TaskExecutionController::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    /// Overrides `task.agent` and is pinned onto the task.
    pub agent: Option<Agent>,
    /// Prompt context for the first attempt.
    pub context: Option<String>,
    /// Falls back to `task.tools` when absent or empty.
    pub tools: Option<Vec<Tool>>,
    pub policy: RetryPolicy,
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<Instant>,
}

impl ExecuteRequest {
    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Result of validating one attempt's output.
enum Verdict {
    Accepted(TaskOutput),
    Retry { context: String },
}

/// Transient per-call state threaded through attempts.
struct RunContext<'a> {
    agent: Agent,
    context: Option<String>,
    tools: Vec<Tool>,
    attempt: u32,
    cancel: Option<&'a CancellationToken>,
    deadline: Option<Instant>,
}

/// Runs tasks end to end and publishes their lifecycle events.
#[derive(Debug)]
pub struct TaskExecutionController {
    emitter: EventEmitter,
    prompts: PromptEngine,
}

impl TaskExecutionController {
    pub fn new(emitter: EventEmitter) -> Result<Self> {
        Ok(Self {
            emitter,
            prompts: PromptEngine::new()?,
        })
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Execute `task` until an output is accepted or every budget is spent.
    ///
    /// Returns the accepted output, or a sentinel with `failure` set when the
    /// run gave up. The exclusive borrow serializes runs of the same task.
    ///
    /// # Errors
    ///
    /// [`TaskError::NoAgentAssigned`] when neither `request` nor `task`
    /// supplies an agent. The executor is never invoked in that case.
    #[instrument(skip_all, fields(
        task = task.name.as_deref().unwrap_or("-"),
        max_retries = task.max_retries,
        max_executor_retries = request.policy.max_executor_retries,
    ))]
    pub fn execute(
        &self,
        task: &mut Task,
        request: ExecuteRequest,
    ) -> Result<TaskOutput, TaskError> {
        let ExecuteRequest {
            agent,
            context,
            tools,
            policy,
            cancel,
            deadline,
        } = request;

        let Some(agent) = agent.or_else(|| task.agent.clone()) else {
            let err = TaskError::NoAgentAssigned {
                description: task.description.clone(),
            };
            error!("no agent assigned");
            task.run_state_mut().end_time = Some(Utc::now());
            self.emit_failed(task, &err);
            return Err(err);
        };
        task.agent = Some(agent.clone());

        let tools = match tools {
            Some(tools) if !tools.is_empty() => tools,
            _ => task.tools.clone(),
        };
        let mut run = RunContext {
            agent,
            context,
            tools,
            attempt: 0,
            cancel: cancel.as_ref(),
            deadline,
        };

        let mut executor_budget = policy.max_executor_retries;
        loop {
            let err = match self.run_guarded(task, &mut run) {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            task.run_state_mut().end_time = Some(Utc::now());
            self.emit_failed(task, &err);

            if !err.is_retryable() || executor_budget == 0 {
                return Ok(self.give_up(task, &run.agent, &err));
            }
            warn!(
                attempt = run.attempt,
                kind = err.kind().as_str(),
                error = %err,
                remaining = executor_budget,
                "attempt failed, retrying"
            );
            info!(delay = ?policy.retry_delay, "waiting before retry");
            if let Err(stop) = wait_for_retry(policy.retry_delay, run.cancel, run.deadline) {
                return Ok(self.give_up(task, &run.agent, &stop));
            }
            executor_budget -= 1;
        }
    }

    /// Attempts until the guardrail accepts, or an error ends the chain.
    fn run_guarded(
        &self,
        task: &mut Task,
        run: &mut RunContext<'_>,
    ) -> Result<TaskOutput, TaskError> {
        loop {
            ensure_may_continue(run.cancel, run.deadline)?;
            run.attempt += 1;
            let output = self.run_once(task, run)?;
            match self.check_guardrail(task, output)? {
                Verdict::Accepted(output) => return self.commit(task, output),
                Verdict::Retry { context } => run.context = Some(context),
            }
        }
    }

    fn run_once(&self, task: &mut Task, run: &RunContext<'_>) -> Result<TaskOutput, TaskError> {
        let role = run.agent.role().to_string();
        let state = task.run_state_mut();
        state.start_time = Some(Utc::now());
        state.prompt_context.clone_from(&run.context);
        state.processed_by_agents.insert(role.clone());

        info!(
            attempt = run.attempt,
            agent = %role,
            retry_count = task.retry_count(),
            "starting attempt"
        );
        self.emitter.emit(&ExecutionEvent::Started {
            task: task.reference(),
            attempt: run.attempt,
            context: run.context.clone(),
        });

        let raw = run
            .agent
            .executor()
            .run(task, run.context.as_deref(), &run.tools)
            .map_err(|err| TaskError::Executor(format!("{err:#}")))?;
        let exported = OutputExporter::new(&task.output_spec).export(&raw)?;

        Ok(TaskOutput {
            name: task.name.clone(),
            description: task.description.clone(),
            expected_output: Some(task.expected_output.clone()),
            raw,
            typed: exported.typed,
            json: exported.json,
            agent: role,
            output_format: task.output_spec.format(),
            failure: None,
        })
    }

    fn check_guardrail(&self, task: &mut Task, output: TaskOutput) -> Result<Verdict, TaskError> {
        let Some(guardrail) = task.guardrail.clone() else {
            return Ok(Verdict::Accepted(output));
        };
        let outcome =
            GuardrailValidator::new(guardrail.as_ref()).validate(&output, task.retry_count())?;

        match outcome {
            GuardrailOutcome::Accepted(AcceptedOutput::Output(replacement)) => {
                Ok(Verdict::Accepted(*replacement))
            }
            GuardrailOutcome::Accepted(AcceptedOutput::Text(text)) => {
                let exported = OutputExporter::new(&task.output_spec).export(&text)?;
                Ok(Verdict::Accepted(TaskOutput {
                    raw: text,
                    typed: exported.typed,
                    json: exported.json,
                    ..output
                }))
            }
            GuardrailOutcome::Rejected(reason) => {
                if !task.consume_guardrail_retry() {
                    return Err(TaskError::GuardrailExhausted {
                        max_retries: task.max_retries,
                        last_error: reason,
                    });
                }
                let context = self
                    .prompts
                    .render_validation_error(&reason, &output.raw)
                    .map_err(|err| TaskError::Template(format!("{err:#}")))?;
                warn!(
                    retry_count = task.retry_count(),
                    reason = %reason,
                    "guardrail blocked, retrying"
                );
                self.emitter.emit(&ExecutionEvent::Failed {
                    task: task.reference(),
                    kind: FailureKind::GuardrailRejected,
                    error: reason,
                });
                Ok(Verdict::Retry { context })
            }
        }
    }

    /// Notify callbacks, store the accepted output, persist, emit `Completed`.
    fn commit(&self, task: &mut Task, output: TaskOutput) -> Result<TaskOutput, TaskError> {
        if let Some(callback) = &task.callback {
            invoke_callback(callback, &output, "task")?;
        }
        let crew_callback = task
            .agent
            .as_ref()
            .and_then(Agent::crew)
            .and_then(Crew::task_callback);
        if let Some(crew_callback) = crew_callback
            && !task
                .callback
                .as_ref()
                .is_some_and(|callback| Arc::ptr_eq(callback, crew_callback))
        {
            invoke_callback(crew_callback, &output, "crew")?;
        }

        let state = task.run_state_mut();
        state.output = Some(output.clone());
        state.end_time = Some(Utc::now());

        if let Some(path) = task.output_file.clone() {
            let persister = OutputPersister::new(task.create_directory);
            let result =
                select_content(&output).and_then(|content| persister.persist(&content, &path));
            let state = task.run_state_mut();
            match result {
                Ok(()) => state.persist_error = None,
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(path = %path.display(), err = %message, "failed to persist output");
                    state.persist_error = Some(message);
                }
            }
        }

        info!(
            retry_count = task.retry_count(),
            format = output.output_format.as_str(),
            "task completed"
        );
        self.emitter.emit(&ExecutionEvent::Completed {
            task: task.reference(),
            output: output.clone(),
        });
        Ok(output)
    }

    fn give_up(&self, task: &mut Task, agent: &Agent, err: &TaskError) -> TaskOutput {
        error!(kind = err.kind().as_str(), error = %err, "giving up on task");
        task.run_state_mut().end_time = Some(Utc::now());
        let output = TaskOutput::failed(agent.role(), err);
        self.emitter.emit(&ExecutionEvent::Completed {
            task: task.reference(),
            output: output.clone(),
        });
        output
    }

    fn emit_failed(&self, task: &Task, err: &TaskError) {
        self.emitter.emit(&ExecutionEvent::Failed {
            task: task.reference(),
            kind: err.kind(),
            error: err.to_string(),
        });
    }
}

/// Run one completion callback, turning an error or a panic into a `TaskError`.
fn invoke_callback(
    callback: &TaskCallback,
    output: &TaskOutput,
    owner: &str,
) -> Result<(), TaskError> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(output))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TaskError::Callback(format!("{owner} callback: {err:#}"))),
        Err(_) => Err(TaskError::Callback(format!("{owner} callback panicked"))),
    }
}
