//! Deterministic, pure logic shared by the controller.
//!
//! Core modules are free of I/O side effects (the retry wait in [`budget`]
//! only sleeps the calling thread). They operate on in-memory values and are
//! testable in isolation.

pub mod budget;
pub mod error;
pub mod export;
pub mod types;
