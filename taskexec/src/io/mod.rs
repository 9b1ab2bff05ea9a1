//! Side-effecting adapters used by the controller and the CLI.

pub mod config;
pub mod events;
pub mod executor;
pub mod guardrail;
pub mod persist;
pub mod process;
pub mod prompt;
