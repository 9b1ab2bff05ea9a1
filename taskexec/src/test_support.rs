//! Scripted collaborators and builders for driving the controller in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};

use crate::core::types::{ExecutionEvent, OutputFormat, TaskOutput};
use crate::execute::TaskExecutionController;
use crate::io::events::{EventEmitter, EventSink};
use crate::io::executor::Executor;
use crate::io::guardrail::{Guardrail, GuardrailResponse};
use crate::task::{Agent, Task, Tool};

/// Executor that replays scripted results and records every call.
///
/// Once the script runs out the last entry repeats.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<Result<String, String>>>,
    calls: Mutex<Vec<Call>>,
}

#[derive(Debug, Clone)]
struct Call {
    context: Option<String>,
    tools: Vec<String>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Result<String, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn always_ok(raw: &str) -> Self {
        Self::new(vec![Ok(raw.to_string())])
    }

    pub fn always_fail(message: &str) -> Self {
        Self::new(vec![Err(message.to_string())])
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    /// Prompt context seen by each call, in order.
    pub fn contexts(&self) -> Vec<Option<String>> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|call| call.context.clone())
            .collect()
    }

    /// Tool names seen by each call, in order.
    pub fn tool_names(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|call| call.tools.clone())
            .collect()
    }

    fn next_result(&self) -> Result<String, String> {
        let mut script = self.script.lock().expect("script lock");
        let mut last = self.last.lock().expect("last lock");
        if let Some(next) = script.pop_front() {
            *last = Some(next);
        }
        last.clone()
            .unwrap_or_else(|| Err("scripted executor has no script".to_string()))
    }
}

impl Executor for ScriptedExecutor {
    fn run(&self, _task: &Task, context: Option<&str>, tools: &[Tool]) -> Result<String> {
        self.calls.lock().expect("calls lock").push(Call {
            context: context.map(str::to_string),
            tools: tools.iter().map(|tool| tool.name.clone()).collect(),
        });
        self.next_result().map_err(|message| anyhow!(message))
    }
}

/// Guardrail that replays scripted responses and records the retry counts it saw.
///
/// Once the script runs out it accepts the output unchanged.
#[derive(Debug, Default)]
pub struct ScriptedGuardrail {
    script: Mutex<VecDeque<GuardrailResponse>>,
    seen_retry_counts: Mutex<Vec<u32>>,
}

impl ScriptedGuardrail {
    pub fn new(script: Vec<GuardrailResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Reject `times` times with `reason`, then accept.
    pub fn reject_times(times: usize, reason: &str) -> Self {
        Self::new(vec![GuardrailResponse::reject(reason); times])
    }

    pub fn calls(&self) -> usize {
        self.seen_retry_counts.lock().expect("seen lock").len()
    }

    pub fn seen_retry_counts(&self) -> Vec<u32> {
        self.seen_retry_counts.lock().expect("seen lock").clone()
    }
}

impl Guardrail for ScriptedGuardrail {
    fn check(&self, output: &TaskOutput, retry_count: u32) -> Result<GuardrailResponse> {
        self.seen_retry_counts
            .lock()
            .expect("seen lock")
            .push(retry_count);
        let next = self.script.lock().expect("script lock").pop_front();
        Ok(next.unwrap_or_else(|| GuardrailResponse::accept_output(output.clone())))
    }
}

/// Event sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .expect("events lock")
            .iter()
            .map(ExecutionEvent::name)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl EventSink for RecordingSink {
    fn handle(&self, event: &ExecutionEvent) -> Result<()> {
        self.events
            .lock()
            .expect("events lock")
            .push(event.clone());
        Ok(())
    }
}

/// Agent backed by the given executor.
pub fn agent_with(role: &str, executor: Arc<ScriptedExecutor>) -> Agent {
    Agent::new(role, executor)
}

/// Controller whose only sink records events.
pub fn controller_with() -> (TaskExecutionController, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let emitter = EventEmitter::new().with_sink(sink.clone());
    let controller = TaskExecutionController::new(emitter).expect("controller");
    (controller, sink)
}

/// Plain raw-format output as produced by an agent called `writer`.
pub fn sample_output(raw: &str) -> TaskOutput {
    TaskOutput {
        name: None,
        description: "sample task".to_string(),
        expected_output: Some("sample output".to_string()),
        raw: raw.to_string(),
        typed: None,
        json: None,
        agent: "writer".to_string(),
        output_format: OutputFormat::Raw,
        failure: None,
    }
}
