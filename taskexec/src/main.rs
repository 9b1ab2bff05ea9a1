use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use taskexec::core::error::TaskError;
use taskexec::execute::TaskExecutionController;
use taskexec::exit_codes;
use taskexec::io::config::load_task_file;

#[derive(Parser)]
#[command(
    name = "taskexec",
    version,
    about = "Run one task through its agent with guardrail and executor retries"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a task file and print the final output.
    Run {
        /// Path to the task file (TOML).
        task_file: PathBuf,
        /// Prompt context for the first attempt.
        #[arg(long)]
        context: Option<String>,
        /// Print the whole output record as JSON instead of the raw text.
        #[arg(long)]
        json: bool,
    },
    /// Load, validate, and build a task file without running it.
    Check {
        /// Path to the task file (TOML).
        task_file: PathBuf,
    },
}

fn main() {
    taskexec::logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run {
            task_file,
            context,
            json,
        } => cmd_run(&task_file, context, json),
        Command::Check { task_file } => cmd_check(&task_file),
    };
    match code {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn cmd_run(task_file: &Path, context: Option<String>, json: bool) -> Result<i32> {
    let file = load_task_file(task_file)?;
    let built = file.build(base_dir(task_file))?;
    let controller = TaskExecutionController::new(built.emitter)?;
    let mut task = built.task;
    let mut request = built.request;
    if let Some(context) = context {
        request = request.with_context(context);
    }

    let output = match controller.execute(&mut task, request) {
        Ok(output) => output,
        Err(err @ TaskError::NoAgentAssigned { .. }) => {
            eprintln!("{err}");
            return Ok(exit_codes::INVALID);
        }
        Err(err) => return Err(err.into()),
    };

    if json {
        let payload = serde_json::to_string_pretty(&output).context("serialize output")?;
        println!("{payload}");
    } else if let Some(failure) = &output.failure {
        eprintln!("{}: {}", output.description, failure.message);
    } else {
        println!("{}", output.raw);
    }
    if let Some(err) = task.run_state().persist_error() {
        eprintln!("warning: output file not written: {err}");
    }

    if output.is_failure() {
        Ok(exit_codes::FAILED)
    } else {
        Ok(exit_codes::OK)
    }
}

fn cmd_check(task_file: &Path) -> Result<i32> {
    let file = load_task_file(task_file)?;
    let built = file.build(base_dir(task_file))?;
    if built.task.agent.is_none() {
        eprintln!("warning: no [agent] section; `run` will fail with no agent assigned");
    }
    println!("ok");
    Ok(exit_codes::OK)
}

fn base_dir(task_file: &Path) -> &Path {
    task_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}
