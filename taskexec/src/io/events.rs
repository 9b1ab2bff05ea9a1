//! Lifecycle event fan-out.
//!
//! Events are best-effort notifications: a sink that errors or panics is
//! logged and skipped, and never changes the outcome of a run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::core::types::ExecutionEvent;

/// Receiver of lifecycle events.
pub trait EventSink: Send + Sync {
    fn handle(&self, event: &ExecutionEvent) -> Result<()>;
}

/// Publishes events to every registered sink, in registration order.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn emit(&self, event: &ExecutionEvent) {
        for sink in &self.sinks {
            match panic::catch_unwind(AssertUnwindSafe(|| sink.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event = event.name(), err = %format!("{err:#}"), "event sink failed");
                }
                Err(_) => {
                    warn!(event = event.name(), "event sink panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Mirrors events into the diagnostic log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn handle(&self, event: &ExecutionEvent) -> Result<()> {
        let task = event.task();
        let name = task.name.as_deref().unwrap_or("-");
        match event {
            ExecutionEvent::Started { attempt, .. } => {
                info!(task = name, attempt, retry_count = task.retry_count, "task started");
            }
            ExecutionEvent::Completed { output, .. } => {
                info!(
                    task = name,
                    failed = output.is_failure(),
                    format = output.output_format.as_str(),
                    "task completed"
                );
            }
            ExecutionEvent::Failed { kind, error, .. } => {
                warn!(task = name, kind = kind.as_str(), error = %error, "task attempt failed");
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    at: DateTime<Utc>,
    event: &'a ExecutionEvent,
}

/// Appends one JSON object per event to a file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn handle(&self, event: &ExecutionEvent) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create event log dir {}", parent.display()))?;
        }
        let record = JsonlRecord {
            at: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&record).context("serialize event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append event log {}", self.path.display()))?;
        Ok(())
    }
}

/// Forwards events to an in-process receiver.
#[derive(Debug)]
pub struct ChannelSink {
    sender: Sender<ExecutionEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<ExecutionEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn handle(&self, event: &ExecutionEvent) -> Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| anyhow!("event receiver dropped"))
    }
}
