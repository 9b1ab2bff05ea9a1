//! Child processes for command-backed agents and guardrails.
//!
//! Input is fed and both output pipes are drained on helper threads while the
//! parent waits, so a chatty child can never deadlock against a full pipe.
//! A descendant that keeps a pipe open after the child exits only delays the
//! result until the timeout (or a short grace after a kill); whatever was read
//! by then is returned.

use std::io::{ErrorKind, Read, Write};
use std::process::{ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const READ_CHUNK_BYTES: usize = 8192;
/// How long pipes may keep draining after a timed-out child is killed.
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Bytes kept from one output pipe, plus how many were dropped past the limit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Result of a finished (or killed) child process.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        self.stdout.text()
    }

    pub fn stderr_lossy(&self) -> String {
        self.stderr.text()
    }
}

/// Build a `Command` from an argv-style vector.
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command must be a non-empty array"))?;
    if program.trim().is_empty() {
        return Err(anyhow!("command program must not be blank"));
    }
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Run `cmd`, feeding it `stdin`, and kill it once `timeout` elapses.
///
/// At most `output_limit_bytes` of each pipe is kept. A child that exits
/// without reading all of its input is not an error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "failed to spawn command");
        anyhow!(err).context("spawn command")
    })?;
    debug!(pid = child.id(), "spawned child process");

    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(pipe)) => Some(spawn_writer(pipe, input.to_vec())),
        (Some(_), None) => return Err(anyhow!("stdin was not piped")),
        (None, _) => None,
    };
    let stdout = child
        .stdout
        .take()
        .map(|pipe| Drain::spawn("stdout", pipe, output_limit_bytes))
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .map(|pipe| Drain::spawn("stderr", pipe, output_limit_bytes))
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("wait command after kill")?, true)
        }
    };

    let drain_until = if timed_out {
        Instant::now() + KILL_DRAIN_GRACE
    } else {
        (started + timeout).max(Instant::now() + KILL_DRAIN_GRACE)
    };
    if let Some(writer) = writer {
        finish(&writer, "stdin writer", drain_until)?;
    }
    let stdout = stdout.finish(drain_until)?;
    let stderr = stderr.finish(drain_until)?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn spawn_writer(mut pipe: ChildStdin, input: Vec<u8>) -> Receiver<Result<()>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = match pipe.write_all(&input) {
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!("child closed stdin early");
                Ok(())
            }
            other => other.context("write stdin"),
        };
        let _ = tx.send(result);
    });
    rx
}

/// Wait for a helper thread until `until`. A thread still blocked by then is
/// left behind.
fn finish(done: &Receiver<Result<()>>, what: &str, until: Instant) -> Result<()> {
    match done.recv_timeout(until.saturating_duration_since(Instant::now())) {
        Ok(result) => result.with_context(|| format!("{what} failed")),
        Err(RecvTimeoutError::Timeout) => {
            warn!(what, "pipe still open after the command finished, giving up on it");
            Ok(())
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("{what} thread panicked")),
    }
}

/// One output pipe read on a helper thread into a shared buffer.
struct Drain {
    what: &'static str,
    buffer: Arc<Mutex<Captured>>,
    done: Receiver<Result<()>>,
}

impl Drain {
    fn spawn<R: Read + Send + 'static>(what: &'static str, pipe: R, limit: usize) -> Self {
        let buffer = Arc::new(Mutex::new(Captured::default()));
        let (tx, done) = mpsc::channel();
        let shared = Arc::clone(&buffer);
        thread::spawn(move || {
            let _ = tx.send(capture(pipe, limit, &shared));
        });
        Self { what, buffer, done }
    }

    /// Whatever was read by `until`, complete or not.
    fn finish(self, until: Instant) -> Result<Captured> {
        finish(&self.done, self.what, until)?;
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| anyhow!("{} buffer poisoned", self.what))?;
        Ok(std::mem::take(&mut *buffer))
    }
}

fn capture<R: Read>(mut reader: R, limit: usize, into: &Mutex<Captured>) -> Result<()> {
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut captured = into
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        let keep = n.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.dropped += n - keep;
    }
}
