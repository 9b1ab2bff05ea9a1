//! Failure taxonomy for a task execution.
//!
//! Every failure the controller can observe is one of these variants. The
//! controller branches on [`TaskError::is_retryable`] instead of on where the
//! error was raised.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while executing a single task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Neither the request nor the task supplied an agent.
    #[error(
        "the task '{description}' has no agent assigned, therefore it can't be executed directly and should be executed by a crew process that assigns one"
    )]
    NoAgentAssigned { description: String },

    /// The executor failed to produce a raw result.
    #[error("executor failed: {0}")]
    Executor(String),

    /// Raw output could not be coerced into the declared output schema.
    #[error("output does not match schema '{schema}': {reason}")]
    SchemaMismatch { schema: String, reason: String },

    /// The guardrail itself errored while validating.
    #[error("guardrail errored: {0}")]
    Guardrail(String),

    /// The guardrail kept rejecting until the task's retry budget ran out.
    #[error("task failed guardrail validation after {max_retries} retries. Last error: {last_error}")]
    GuardrailExhausted { max_retries: u32, last_error: String },

    /// The guardrail accepted but returned nothing usable.
    #[error("guardrail broke its contract: {0}")]
    GuardrailContractViolation(String),

    /// A task or crew completion callback failed.
    #[error("completion callback failed: {0}")]
    Callback(String),

    /// A message template failed to render.
    #[error("template rendering failed: {0}")]
    Template(String),

    /// The caller cancelled the run.
    #[error("execution cancelled")]
    Cancelled,

    /// The run's deadline passed before it could finish.
    #[error("execution deadline exceeded")]
    DeadlineExceeded,
}

impl TaskError {
    /// Serializable tag for this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            TaskError::NoAgentAssigned { .. } => FailureKind::NoAgentAssigned,
            TaskError::Executor(_) => FailureKind::ExecutorFailure,
            TaskError::SchemaMismatch { .. } => FailureKind::SchemaMismatch,
            TaskError::Guardrail(_) => FailureKind::GuardrailError,
            TaskError::GuardrailExhausted { .. } => FailureKind::GuardrailExhausted,
            TaskError::GuardrailContractViolation(_) => FailureKind::GuardrailContractViolation,
            TaskError::Callback(_) => FailureKind::Callback,
            TaskError::Template(_) => FailureKind::Template,
            TaskError::Cancelled => FailureKind::Cancelled,
            TaskError::DeadlineExceeded => FailureKind::DeadlineExceeded,
        }
    }

    /// Whether the executor-retry budget may be spent on this error.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Tag identifying why an attempt or a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoAgentAssigned,
    ExecutorFailure,
    SchemaMismatch,
    GuardrailError,
    /// A single guardrail rejection that will be retried.
    GuardrailRejected,
    GuardrailExhausted,
    GuardrailContractViolation,
    Callback,
    Template,
    Cancelled,
    DeadlineExceeded,
}

impl FailureKind {
    /// Only a missing agent and a stopped run are terminal.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            FailureKind::NoAgentAssigned | FailureKind::Cancelled | FailureKind::DeadlineExceeded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NoAgentAssigned => "no_agent_assigned",
            FailureKind::ExecutorFailure => "executor_failure",
            FailureKind::SchemaMismatch => "schema_mismatch",
            FailureKind::GuardrailError => "guardrail_error",
            FailureKind::GuardrailRejected => "guardrail_rejected",
            FailureKind::GuardrailExhausted => "guardrail_exhausted",
            FailureKind::GuardrailContractViolation => "guardrail_contract_violation",
            FailureKind::Callback => "callback",
            FailureKind::Template => "template",
            FailureKind::Cancelled => "cancelled",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
