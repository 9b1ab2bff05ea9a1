//! Guardrail contract and its normalization into [`GuardrailOutcome`].
//!
//! A [`Guardrail`] answers with a loosely-shaped [`GuardrailResponse`];
//! [`GuardrailValidator`] turns that into exactly one of accepted or rejected
//! and classifies everything else as a typed [`TaskError`].

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::error::TaskError;
use crate::core::types::{AcceptedOutput, GuardrailOutcome, TaskOutput};
use crate::io::process::{command_from_argv, run_command_with_timeout};

pub const DEFAULT_GUARDRAIL_TIMEOUT: Duration = Duration::from_secs(120);
const GUARDRAIL_OUTPUT_LIMIT_BYTES: usize = 1_000_000;
const RETRY_COUNT_ENV: &str = "TASKEXEC_RETRY_COUNT";
const DEFAULT_REJECTION_REASON: &str = "guardrail rejected the output without a reason";

/// Value handed back by an accepting guardrail.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailValue {
    Text(String),
    Output(TaskOutput),
}

/// Raw guardrail answer before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailResponse {
    /// Accept with a replacement (or the original output cloned back).
    Accept(Option<GuardrailValue>),
    /// Reject with a reason that is fed into the next attempt.
    Reject(String),
}

impl GuardrailResponse {
    pub fn accept_text(text: impl Into<String>) -> Self {
        Self::Accept(Some(GuardrailValue::Text(text.into())))
    }

    pub fn accept_output(output: TaskOutput) -> Self {
        Self::Accept(Some(GuardrailValue::Output(output)))
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(reason.into())
    }
}

/// User-supplied validation of a completed attempt.
pub trait Guardrail: Send + Sync {
    fn check(&self, output: &TaskOutput, retry_count: u32) -> Result<GuardrailResponse>;
}

impl<F> Guardrail for F
where
    F: Fn(&TaskOutput, u32) -> Result<GuardrailResponse> + Send + Sync,
{
    fn check(&self, output: &TaskOutput, retry_count: u32) -> Result<GuardrailResponse> {
        self(output, retry_count)
    }
}

/// Invokes a guardrail once and normalizes the verdict.
pub struct GuardrailValidator<'a> {
    guardrail: &'a dyn Guardrail,
}

impl<'a> GuardrailValidator<'a> {
    pub fn new(guardrail: &'a dyn Guardrail) -> Self {
        Self { guardrail }
    }

    /// Never retries; a guardrail error is reported as `TaskError::Guardrail`.
    pub fn validate(
        &self,
        output: &TaskOutput,
        retry_count: u32,
    ) -> Result<GuardrailOutcome, TaskError> {
        let response = self
            .guardrail
            .check(output, retry_count)
            .map_err(|err| TaskError::Guardrail(format!("{err:#}")))?;
        normalize(response)
    }
}

fn normalize(response: GuardrailResponse) -> Result<GuardrailOutcome, TaskError> {
    match response {
        GuardrailResponse::Accept(None) => Err(TaskError::GuardrailContractViolation(
            "guardrail accepted without returning a result".to_string(),
        )),
        GuardrailResponse::Accept(Some(GuardrailValue::Text(text))) => {
            if text.trim().is_empty() {
                return Err(TaskError::GuardrailContractViolation(
                    "guardrail accepted with empty text".to_string(),
                ));
            }
            Ok(GuardrailOutcome::Accepted(AcceptedOutput::Text(text)))
        }
        GuardrailResponse::Accept(Some(GuardrailValue::Output(output))) => {
            if output.is_empty() {
                return Err(TaskError::GuardrailContractViolation(
                    "guardrail accepted with an empty output".to_string(),
                ));
            }
            Ok(GuardrailOutcome::Accepted(AcceptedOutput::Output(Box::new(
                output,
            ))))
        }
        GuardrailResponse::Reject(reason) => {
            let reason = reason.trim();
            let reason = if reason.is_empty() {
                DEFAULT_REJECTION_REASON.to_string()
            } else {
                reason.to_string()
            };
            Ok(GuardrailOutcome::Rejected(reason))
        }
    }
}

/// Guardrail backed by an external command.
///
/// The raw output is piped to stdin and the retry count is exported as
/// `TASKEXEC_RETRY_COUNT`. Exit 0 accepts (stdout, when present, replaces the
/// raw text); any other exit rejects with stderr or stdout as the reason.
#[derive(Debug, Clone)]
pub struct CommandGuardrail {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandGuardrail {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("guardrail command must be a non-empty array"));
        }
        Ok(Self {
            command,
            timeout: DEFAULT_GUARDRAIL_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_command(&self, retry_count: u32) -> Result<Command> {
        let mut cmd = command_from_argv(&self.command)?;
        cmd.env(RETRY_COUNT_ENV, retry_count.to_string());
        Ok(cmd)
    }
}

impl Guardrail for CommandGuardrail {
    #[instrument(skip_all, fields(retry_count, timeout_secs = self.timeout.as_secs()))]
    fn check(&self, output: &TaskOutput, retry_count: u32) -> Result<GuardrailResponse> {
        let cmd = self.build_command(retry_count)?;
        let result = run_command_with_timeout(
            cmd,
            Some(output.raw.as_bytes()),
            self.timeout,
            GUARDRAIL_OUTPUT_LIMIT_BYTES,
        )
        .context("run guardrail command")?;

        if result.timed_out {
            warn!("guardrail command timed out");
            return Err(anyhow!("guardrail timed out after {:?}", self.timeout));
        }

        let stdout = result.stdout_lossy();
        if result.status.success() {
            let replacement = stdout.trim();
            debug!(replaced = !replacement.is_empty(), "guardrail accepted");
            if replacement.is_empty() {
                return Ok(GuardrailResponse::accept_output(output.clone()));
            }
            return Ok(GuardrailResponse::accept_text(replacement));
        }

        let stderr = result.stderr_lossy();
        let reason = [stderr.trim(), stdout.trim()]
            .into_iter()
            .find(|text| !text.is_empty())
            .map_or_else(
                || {
                    format!(
                        "guardrail command exited with status {:?}",
                        result.status.code()
                    )
                },
                str::to_string,
            );
        debug!(exit_code = ?result.status.code(), "guardrail rejected");
        Ok(GuardrailResponse::Reject(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::FailureKind;
    use crate::test_support::sample_output;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| (*part).to_string()).collect()
    }

    #[test]
    fn closure_rejection_passes_reason_through() {
        let guardrail = |output: &TaskOutput, _retry: u32| -> Result<GuardrailResponse> {
            if output.raw.len() < 10 {
                Ok(GuardrailResponse::reject("too short"))
            } else {
                Ok(GuardrailResponse::accept_output(output.clone()))
            }
        };
        let outcome = GuardrailValidator::new(&guardrail)
            .validate(&sample_output("tiny"), 0)
            .expect("validate");
        assert_eq!(outcome, GuardrailOutcome::Rejected("too short".to_string()));
    }

    #[test]
    fn blank_rejection_gets_default_reason() {
        let guardrail = |_: &TaskOutput, _: u32| -> Result<GuardrailResponse> {
            Ok(GuardrailResponse::reject("  "))
        };
        let outcome = GuardrailValidator::new(&guardrail)
            .validate(&sample_output("x"), 0)
            .expect("validate");
        assert_eq!(
            outcome,
            GuardrailOutcome::Rejected(DEFAULT_REJECTION_REASON.to_string())
        );
    }

    #[test]
    fn accept_without_result_violates_contract() {
        let guardrail = |_: &TaskOutput, _: u32| -> Result<GuardrailResponse> {
            Ok(GuardrailResponse::Accept(None))
        };
        let err = GuardrailValidator::new(&guardrail)
            .validate(&sample_output("x"), 0)
            .expect_err("contract violation");
        assert_eq!(err.kind(), FailureKind::GuardrailContractViolation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn accept_with_blank_text_violates_contract() {
        let guardrail = |_: &TaskOutput, _: u32| -> Result<GuardrailResponse> {
            Ok(GuardrailResponse::accept_text("\n"))
        };
        let err = GuardrailValidator::new(&guardrail)
            .validate(&sample_output("x"), 0)
            .expect_err("contract violation");
        assert_eq!(err.kind(), FailureKind::GuardrailContractViolation);
    }

    #[test]
    fn guardrail_error_is_retryable() {
        let guardrail = |_: &TaskOutput, _: u32| -> Result<GuardrailResponse> {
            Err(anyhow!("validator offline"))
        };
        let err = GuardrailValidator::new(&guardrail)
            .validate(&sample_output("x"), 0)
            .expect_err("guardrail error");
        assert_eq!(err, TaskError::Guardrail("validator offline".to_string()));
        assert!(err.is_retryable());
    }

    #[test]
    fn retry_count_is_forwarded() {
        let guardrail = |output: &TaskOutput, retry: u32| -> Result<GuardrailResponse> {
            if retry >= 2 {
                Ok(GuardrailResponse::accept_output(output.clone()))
            } else {
                Ok(GuardrailResponse::reject(format!("attempt {retry}")))
            }
        };
        let validator = GuardrailValidator::new(&guardrail);
        let output = sample_output("x");
        assert_eq!(
            validator.validate(&output, 1).expect("validate"),
            GuardrailOutcome::Rejected("attempt 1".to_string())
        );
        assert!(matches!(
            validator.validate(&output, 2).expect("validate"),
            GuardrailOutcome::Accepted(AcceptedOutput::Output(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn command_guardrail_accepts_unchanged_on_silent_success() {
        let guardrail =
            CommandGuardrail::new(argv(&["sh", "-c", "cat >/dev/null"])).expect("guardrail");
        let output = sample_output("draft");
        let response = guardrail.check(&output, 0).expect("check");
        assert_eq!(response, GuardrailResponse::accept_output(output));
    }

    #[cfg(unix)]
    #[test]
    fn command_guardrail_stdout_replaces_text() {
        let guardrail =
            CommandGuardrail::new(argv(&["sh", "-c", "tr a-z A-Z"])).expect("guardrail");
        let response = guardrail.check(&sample_output("draft"), 0).expect("check");
        assert_eq!(response, GuardrailResponse::accept_text("DRAFT"));
    }

    #[cfg(unix)]
    #[test]
    fn command_guardrail_rejects_with_stderr_and_sees_retry_count() {
        let guardrail = CommandGuardrail::new(argv(&[
            "sh",
            "-c",
            "cat >/dev/null; echo \"retry $TASKEXEC_RETRY_COUNT: too short\" >&2; exit 1",
        ]))
        .expect("guardrail");
        let response = guardrail.check(&sample_output("x"), 2).expect("check");
        assert_eq!(response, GuardrailResponse::reject("retry 2: too short"));
    }

    #[cfg(unix)]
    #[test]
    fn command_guardrail_silent_failure_reports_status() {
        let guardrail = CommandGuardrail::new(argv(&["sh", "-c", "cat >/dev/null; exit 4"]))
            .expect("guardrail");
        let response = guardrail.check(&sample_output("x"), 0).expect("check");
        assert_eq!(
            response,
            GuardrailResponse::reject("guardrail command exited with status Some(4)")
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_guardrail_timeout_is_an_error() {
        let guardrail = CommandGuardrail::new(argv(&["sleep", "5"]))
            .expect("guardrail")
            .with_timeout(Duration::from_millis(100));
        assert!(guardrail.check(&sample_output("x"), 0).is_err());
    }
}
