//! CLI tests for `taskexec run` and `taskexec check`.
//!
//! Spawns the binary against task files whose agent and guardrail are plain
//! shell commands.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::Command;

use taskexec::exit_codes;

fn write_task(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("task.toml");
    fs::write(&path, body).expect("write task file");
    path
}

#[test]
fn run_prints_agent_output_and_writes_events() {
    let temp = tempfile::tempdir().expect("tempdir");
    let task_file = write_task(
        temp.path(),
        r#"
[task]
name = "greet"
description = "Say hello"
expected_output = "A greeting"
output_file = "out/greeting.txt"

[agent]
role = "greeter"
command = ["sh", "-c", "cat >/dev/null; echo hello"]

[execution]
retry_delay_ms = 0

[events]
jsonl_path = "events.jsonl"
log = false
"#,
    );

    let output = Command::new(env!("CARGO_BIN_EXE_taskexec"))
        .arg("run")
        .arg(&task_file)
        .output()
        .expect("taskexec run");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    assert_eq!(
        fs::read_to_string(temp.path().join("out/greeting.txt")).expect("output file"),
        "hello"
    );
    let events = fs::read_to_string(temp.path().join("events.jsonl")).expect("events");
    assert_eq!(events.lines().count(), 2);
}

#[test]
fn run_exits_failed_when_every_attempt_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let task_file = write_task(
        temp.path(),
        r#"
[task]
description = "Say hello"
expected_output = "A greeting"

[agent]
role = "greeter"
command = ["sh", "-c", "cat >/dev/null; echo broken >&2; exit 1"]

[execution]
max_executor_retries = 1
retry_delay_ms = 0
"#,
    );

    let output = Command::new(env!("CARGO_BIN_EXE_taskexec"))
        .arg("run")
        .arg(&task_file)
        .arg("--json")
        .output()
        .expect("taskexec run");

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("json output");
    assert_eq!(value["description"], "Task failed");
    assert_eq!(value["failure"]["kind"], "executor_failure");
}

#[test]
fn run_without_agent_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let task_file = write_task(
        temp.path(),
        "[task]\ndescription = \"d\"\nexpected_output = \"e\"\n",
    );

    let status = Command::new(env!("CARGO_BIN_EXE_taskexec"))
        .arg("run")
        .arg(&task_file)
        .status()
        .expect("taskexec run");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn check_rejects_invalid_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let task_file = write_task(temp.path(), "[task]\ndescription = \"\"\n");

    let status = Command::new(env!("CARGO_BIN_EXE_taskexec"))
        .arg("check")
        .arg(&task_file)
        .status()
        .expect("taskexec check");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}
