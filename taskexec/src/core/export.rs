//! Raw result to structured payload conversion.
//!
//! Pure and deterministic: the same raw text and spec always produce the same
//! payloads. Coercion accepts bare JSON, a fenced ```json block, or the
//! outermost `{...}` span embedded in prose.

use std::sync::LazyLock;

use jsonschema::validator_for;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::error::TaskError;
use crate::core::types::{OutputFormat, TypedOutput};

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("fenced json pattern should be valid")
});
static OBJECT_SPAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("object span pattern should be valid"));

/// A named JSON Schema that structured output must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    name: String,
    schema: Value,
}

impl OutputSchema {
    /// Build a schema, rejecting documents that do not compile.
    pub fn new(name: impl Into<String>, schema: Value) -> Result<Self, TaskError> {
        let name = name.into();
        validator_for(&schema).map_err(|err| TaskError::SchemaMismatch {
            schema: name.clone(),
            reason: format!("invalid schema: {err}"),
        })?;
        Ok(Self { name, schema })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    fn validate(&self, instance: &Value) -> Result<(), TaskError> {
        let compiled = validator_for(&self.schema).map_err(|err| self.mismatch(err.to_string()))?;
        let messages: Vec<String> = compiled
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(self.mismatch(messages.join("; ")));
        }
        Ok(())
    }

    fn mismatch(&self, reason: impl Into<String>) -> TaskError {
        TaskError::SchemaMismatch {
            schema: self.name.clone(),
            reason: reason.into(),
        }
    }
}

/// Declared shape of a task's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OutputSpec {
    #[default]
    Raw,
    Json(OutputSchema),
    Typed(OutputSchema),
}

impl OutputSpec {
    pub fn format(&self) -> OutputFormat {
        match self {
            OutputSpec::Raw => OutputFormat::Raw,
            OutputSpec::Json(_) => OutputFormat::Json,
            OutputSpec::Typed(_) => OutputFormat::Typed,
        }
    }

    pub fn schema(&self) -> Option<&OutputSchema> {
        match self {
            OutputSpec::Raw => None,
            OutputSpec::Json(schema) | OutputSpec::Typed(schema) => Some(schema),
        }
    }
}

/// Structured payloads derived from a raw result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportedOutput {
    pub typed: Option<TypedOutput>,
    pub json: Option<Map<String, Value>>,
}

/// Converts raw executor text into the payloads declared by an [`OutputSpec`].
#[derive(Debug, Clone, Copy)]
pub struct OutputExporter<'a> {
    spec: &'a OutputSpec,
}

impl<'a> OutputExporter<'a> {
    pub fn new(spec: &'a OutputSpec) -> Self {
        Self { spec }
    }

    pub fn export(&self, raw: &str) -> Result<ExportedOutput, TaskError> {
        let schema = match self.spec {
            OutputSpec::Raw => return Ok(ExportedOutput::default()),
            OutputSpec::Json(schema) | OutputSpec::Typed(schema) => schema,
        };

        let value =
            coerce_json(raw).ok_or_else(|| schema.mismatch("no JSON object found in output"))?;
        if !value.is_object() {
            return Err(schema.mismatch(format!(
                "expected a JSON object, got {}",
                json_type_name(&value)
            )));
        }
        schema.validate(&value)?;
        debug!(schema = schema.name(), format = self.spec.format().as_str(), "exported output");

        let exported = match self.spec {
            OutputSpec::Json(_) => ExportedOutput {
                typed: None,
                json: match value {
                    Value::Object(object) => Some(object),
                    _ => None,
                },
            },
            _ => ExportedOutput {
                typed: Some(TypedOutput {
                    schema: schema.name().to_string(),
                    value,
                }),
                json: None,
            },
        };
        Ok(exported)
    }
}

/// Best-effort extraction of a JSON value from model-style text.
pub fn coerce_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    if let Some(body) = FENCED_JSON_RE.captures(trimmed).and_then(|caps| caps.get(1))
        && let Ok(value) = serde_json::from_str::<Value>(body.as_str().trim())
    {
        return Some(value);
    }
    OBJECT_SPAN_RE
        .find(trimmed)
        .and_then(|span| serde_json::from_str::<Value>(span.as_str()).ok())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary_schema() -> OutputSchema {
        OutputSchema::new(
            "Summary",
            json!({
                "type": "object",
                "required": ["title", "points"],
                "properties": {
                    "title": {"type": "string"},
                    "points": {"type": "array", "items": {"type": "string"}}
                }
            }),
        )
        .expect("schema")
    }

    #[test]
    fn raw_spec_exports_nothing() {
        let exported = OutputExporter::new(&OutputSpec::Raw)
            .export("{\"title\": \"ignored\"}")
            .expect("export");
        assert_eq!(exported, ExportedOutput::default());
    }

    #[test]
    fn json_spec_exports_object() {
        let spec = OutputSpec::Json(summary_schema());
        let exported = OutputExporter::new(&spec)
            .export("{\"title\": \"t\", \"points\": [\"a\"]}")
            .expect("export");
        let object = exported.json.expect("json payload");
        assert_eq!(object["title"], "t");
        assert!(exported.typed.is_none());
    }

    #[test]
    fn typed_spec_extracts_fenced_block() {
        let spec = OutputSpec::Typed(summary_schema());
        let raw = "Here you go:\n```json\n{\"title\": \"t\", \"points\": []}\n```\nThanks";
        let exported = OutputExporter::new(&spec).export(raw).expect("export");
        let typed = exported.typed.expect("typed payload");
        assert_eq!(typed.schema, "Summary");
        assert_eq!(typed.value["title"], "t");
        assert!(exported.json.is_none());
    }

    #[test]
    fn extracts_object_embedded_in_prose() {
        let value = coerce_json("Final answer: {\"title\": \"t\"} -- done").expect("value");
        assert_eq!(value["title"], "t");
    }

    #[test]
    fn schema_violation_is_mismatch() {
        let spec = OutputSpec::Json(summary_schema());
        let err = OutputExporter::new(&spec)
            .export("{\"title\": 3}")
            .expect_err("should mismatch");
        assert!(matches!(err, TaskError::SchemaMismatch { ref schema, .. } if schema == "Summary"));
    }

    #[test]
    fn non_object_is_mismatch() {
        let spec = OutputSpec::Typed(summary_schema());
        let err = OutputExporter::new(&spec)
            .export("[1, 2, 3]")
            .expect_err("should mismatch");
        assert!(err.to_string().contains("expected a JSON object, got array"));
    }

    #[test]
    fn plain_prose_is_mismatch() {
        let spec = OutputSpec::Json(summary_schema());
        let err = OutputExporter::new(&spec)
            .export("no structure here")
            .expect_err("should mismatch");
        assert!(err.to_string().contains("no JSON object found"));
    }

    #[test]
    fn export_is_idempotent() {
        let spec = OutputSpec::Typed(summary_schema());
        let exporter = OutputExporter::new(&spec);
        let raw = "{\"title\": \"t\", \"points\": [\"x\", \"y\"]}";
        assert_eq!(
            exporter.export(raw).expect("first"),
            exporter.export(raw).expect("second")
        );
    }

    #[test]
    fn invalid_schema_is_rejected_up_front() {
        let err = OutputSchema::new("Broken", json!({"type": 12})).expect_err("invalid schema");
        assert!(err.to_string().contains("invalid schema"));
    }
}
