//! External process invocation for the terraform and az CLIs.
//!
//! Every invocation echoes a `$ cmd` line so runs read like a transcript.
//! Failures carry the original exit code so `main` can propagate it.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("command `{program}` failed with exit code {code}")]
pub struct CommandError {
    pub program: String,
    pub code: i32,
    /// Combined stdout+stderr when the invocation was captured, empty when
    /// output streamed to the terminal.
    pub output: String,
}

/// Exit code reported when the child was killed by a signal.
const SIGNAL_EXIT: i32 = 1;

fn echo(program: &Path, args: &[String], redacted: &[usize]) {
    let mut display: Vec<String> = Vec::with_capacity(args.len() + 1);
    display.push(program.display().to_string());
    for (idx, arg) in args.iter().enumerate() {
        if redacted.contains(&idx) {
            display.push("***".to_string());
        } else {
            display.push(arg.clone());
        }
    }
    println!("\n$ {}", display.join(" "));
}

/// Run a command, streaming output to the terminal.
pub fn run(program: &Path, args: &[String]) -> Result<(), CommandError> {
    run_redacted(program, args, &[])
}

/// Run a command with selected argv positions replaced by `***` in the echo.
/// The real argv is passed to the child unchanged.
pub fn run_redacted(
    program: &Path,
    args: &[String],
    redacted: &[usize],
) -> Result<(), CommandError> {
    echo(program, args, redacted);
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|err| spawn_error(program, &err))?;
    if status.success() {
        return Ok(());
    }
    Err(CommandError {
        program: program.display().to_string(),
        code: status.code().unwrap_or(SIGNAL_EXIT),
        output: String::new(),
    })
}

/// Run a command and return trimmed stdout.
pub fn run_capture(program: &Path, args: &[String]) -> Result<String, CommandError> {
    echo(program, args, &[]);
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| spawn_error(program, &err))?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(CommandError {
        program: program.display().to_string(),
        code: output.status.code().unwrap_or(SIGNAL_EXIT),
        output: format!("{stdout}{stderr}"),
    })
}

/// Outcome of a captured invocation that is allowed to fail.
#[derive(Debug)]
pub struct Captured {
    pub success: bool,
    pub code: i32,
    pub combined: String,
}

/// Run a command, capturing stdout and stderr without treating a non-zero
/// exit as an error. Captured output is replayed to the terminal.
pub fn run_captured_lenient(program: &Path, args: &[String]) -> Result<Captured, CommandError> {
    echo(program, args, &[]);
    let start = std::time::Instant::now();
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| spawn_error(program, &err))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !stdout.is_empty() {
        print!("{stdout}");
    }
    if !stderr.is_empty() {
        eprint!("{stderr}");
    }
    tracing::debug!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        code = output.status.code().unwrap_or(SIGNAL_EXIT),
        "command complete"
    );
    Ok(Captured {
        success: output.status.success(),
        code: output.status.code().unwrap_or(SIGNAL_EXIT),
        combined: format!("{stdout}{stderr}"),
    })
}

fn spawn_error(program: &Path, err: &std::io::Error) -> CommandError {
    CommandError {
        program: program.display().to_string(),
        code: SIGNAL_EXIT,
        output: format!("failed to spawn: {err}"),
    }
}
