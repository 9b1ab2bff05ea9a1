//! Prompt and retry-message rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::task::{Task, Tool};

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const VALIDATION_ERROR_TEMPLATE: &str = include_str!("prompts/validation_error.md");

/// Template engine wrapper around minijinja.
#[derive(Debug)]
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .context("load task template")?;
        env.add_template("validation_error", VALIDATION_ERROR_TEMPLATE)
            .context("load validation_error template")?;
        Ok(Self { env })
    }

    /// Prompt handed to a command-backed executor.
    pub fn render_task(
        &self,
        task: &Task,
        prompt_context: Option<&str>,
        tools: &[Tool],
    ) -> Result<String> {
        let schema = task.output_spec.schema();
        let schema_json = schema
            .map(|schema| serde_json::to_string_pretty(schema.schema()))
            .transpose()
            .context("serialize output schema")?;
        let template = self.env.get_template("task")?;
        let rendered = template.render(context! {
            description => task.description.trim(),
            expected_output => task.expected_output.trim(),
            schema_name => schema.map(|schema| schema.name()),
            schema => schema_json,
            tools => tools,
            context => prompt_context.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    /// Context for the next attempt after a guardrail rejection.
    pub fn render_validation_error(&self, error: &str, rejected_output: &str) -> Result<String> {
        let template = self.env.get_template("validation_error")?;
        let rendered = template.render(context! {
            error => error.trim(),
            output => rejected_output,
        })?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::export::{OutputSchema, OutputSpec};
    use serde_json::json;

    #[test]
    fn task_prompt_includes_description_context_and_tools() {
        let engine = PromptEngine::new().expect("engine");
        let task = Task::new("Summarize the release notes", "Three bullet points");
        let tools = vec![Tool::new("search", "web search"), Tool::new("calc", "")];

        let prompt = engine
            .render_task(&task, Some("notes: v1.2 adds retries"), &tools)
            .expect("render");

        assert!(prompt.starts_with("Summarize the release notes"));
        assert!(prompt.contains("expected criteria for your final answer: Three bullet points"));
        assert!(prompt.contains("- search: web search"));
        assert!(prompt.contains("- calc"));
        assert!(!prompt.contains("- calc:"));
        assert!(prompt.contains("notes: v1.2 adds retries"));
        assert!(!prompt.contains("JSON Schema"));
    }

    #[test]
    fn task_prompt_embeds_schema_for_structured_output() {
        let engine = PromptEngine::new().expect("engine");
        let schema = OutputSchema::new("Summary", json!({"type": "object"})).expect("schema");
        let task = Task::new("d", "e").with_output_spec(OutputSpec::Json(schema));

        let prompt = engine.render_task(&task, None, &[]).expect("render");
        assert!(prompt.contains("`Summary`"));
        assert!(prompt.contains("\"type\": \"object\""));
        assert!(!prompt.contains("context you're working with"));
    }

    #[test]
    fn validation_error_embeds_reason_and_rejected_output() {
        let engine = PromptEngine::new().expect("engine");
        let message = engine
            .render_validation_error("too short", "tiny draft")
            .expect("render");
        assert!(message.contains("Previous attempt failed validation: too short"));
        assert!(message.contains("### Previous result:\ntiny draft"));
        assert!(message.contains("address the validation error"));
    }
}
