//! Task-execution controller.
//!
//! Runs one task through its agent, exports the raw answer into a structured
//! output, optionally gates it behind a guardrail, and retries under two
//! independent budgets: guardrail rejections (bounded by the task's
//! `max_retries`) and executor failures (bounded per call by the
//! [`RetryPolicy`](core::budget::RetryPolicy)).
//!
//! - **[`core`]**: Pure, deterministic logic (error taxonomy, export, budgets).
//! - **[`io`]**: Side-effecting adapters (processes, guardrails, events, files).
//!
//! [`execute`] ties them together; [`task`] holds the mutable task model.

pub mod core;
pub mod execute;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
