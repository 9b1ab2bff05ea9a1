//! Shared types passed between the controller and its collaborators.
//!
//! These are plain data: no I/O, no collaborator handles. Everything here is
//! serializable so it can be logged, persisted, or shipped over an event sink.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::{FailureKind, TaskError};

/// Description used on the output returned when every retry budget is spent.
pub const FAILED_TASK_DESCRIPTION: &str = "Task failed";

/// Shape of the structured payload attached to a [`TaskOutput`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Raw,
    Json,
    Typed,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Raw => "raw",
            OutputFormat::Json => "json",
            OutputFormat::Typed => "typed",
        }
    }
}

/// Schema-validated payload tagged with the name of the schema it matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedOutput {
    pub schema: String,
    pub value: Value,
}

impl TypedOutput {
    /// Canonical text form (compact JSON), used when persisting.
    pub fn to_canonical_json(&self) -> String {
        self.value.to_string()
    }
}

/// Why a run ended without an accepted output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&TaskError> for FailureInfo {
    fn from(err: &TaskError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Record of a completed attempt.
///
/// Built once per accepted attempt. A guardrail may swap it out wholesale.
/// The give-up path produces a sentinel with `failure` set and no content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub name: Option<String>,
    pub description: String,
    pub expected_output: Option<String>,
    pub raw: String,
    pub typed: Option<TypedOutput>,
    pub json: Option<Map<String, Value>>,
    pub agent: String,
    pub output_format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

impl TaskOutput {
    /// Sentinel returned when the run gave up. Keeps the agent identity and the
    /// error that ended the run.
    pub fn failed(agent: impl Into<String>, err: &TaskError) -> Self {
        Self {
            name: None,
            description: FAILED_TASK_DESCRIPTION.to_string(),
            expected_output: None,
            raw: String::new(),
            typed: None,
            json: None,
            agent: agent.into(),
            output_format: OutputFormat::Raw,
            failure: Some(FailureInfo::from(err)),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    /// True when the output carries no raw text and no structured payload.
    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty() && self.typed.is_none() && self.json.is_none()
    }

    /// Deserialize the typed payload into a caller-provided type.
    pub fn typed_as<T: DeserializeOwned>(&self) -> Option<serde_json::Result<T>> {
        self.typed
            .as_ref()
            .map(|typed| serde_json::from_value(typed.value.clone()))
    }
}

/// Normalized guardrail verdict. Exactly one of accepted or rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailOutcome {
    Accepted(AcceptedOutput),
    Rejected(String),
}

/// What an accepting guardrail handed back.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptedOutput {
    /// Replacement raw text; structured payloads are re-exported from it.
    Text(String),
    /// Full replacement output, substituted as-is.
    Output(Box<TaskOutput>),
}

/// Identity of the task an event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub name: Option<String>,
    pub description: String,
    pub agent: Option<String>,
    pub retry_count: u32,
}

/// Lifecycle notification published by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started {
        task: TaskRef,
        attempt: u32,
        context: Option<String>,
    },
    Completed {
        task: TaskRef,
        output: TaskOutput,
    },
    Failed {
        task: TaskRef,
        kind: FailureKind,
        error: String,
    },
}

impl ExecutionEvent {
    pub fn task(&self) -> &TaskRef {
        match self {
            ExecutionEvent::Started { task, .. }
            | ExecutionEvent::Completed { task, .. }
            | ExecutionEvent::Failed { task, .. } => task,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::Started { .. } => "started",
            ExecutionEvent::Completed { .. } => "completed",
            ExecutionEvent::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn failed_sentinel_has_no_content_and_keeps_error() {
        let err = TaskError::Executor("connection reset".to_string());
        let output = TaskOutput::failed("researcher", &err);

        assert_eq!(output.description, FAILED_TASK_DESCRIPTION);
        assert_eq!(output.agent, "researcher");
        assert!(output.raw.is_empty());
        assert!(output.typed.is_none());
        assert!(output.json.is_none());
        assert!(output.is_failure());
        assert!(output.is_empty());

        let failure = output.failure.expect("failure info");
        assert_eq!(failure.kind, FailureKind::ExecutorFailure);
        assert!(failure.message.contains("connection reset"));
    }

    #[test]
    fn typed_as_deserializes_payload() {
        #[derive(Deserialize)]
        struct Summary {
            title: String,
        }

        let output = TaskOutput {
            name: None,
            description: "d".to_string(),
            expected_output: None,
            raw: "{\"title\":\"t\"}".to_string(),
            typed: Some(TypedOutput {
                schema: "Summary".to_string(),
                value: serde_json::json!({"title": "t"}),
            }),
            json: None,
            agent: "writer".to_string(),
            output_format: OutputFormat::Typed,
            failure: None,
        };

        let summary: Summary = output.typed_as().expect("typed").expect("deserialize");
        assert_eq!(summary.title, "t");
        assert_eq!(
            output.typed.as_ref().map(TypedOutput::to_canonical_json),
            Some("{\"title\":\"t\"}".to_string())
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ExecutionEvent::Failed {
            task: TaskRef {
                name: Some("summarize".to_string()),
                description: "d".to_string(),
                agent: Some("writer".to_string()),
                retry_count: 1,
            },
            kind: FailureKind::GuardrailRejected,
            error: "too short".to_string(),
        };
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["type"], "failed");
        assert_eq!(value["kind"], "guardrail_rejected");
        assert_eq!(event.name(), "failed");
        assert_eq!(event.task().retry_count, 1);
    }
}
