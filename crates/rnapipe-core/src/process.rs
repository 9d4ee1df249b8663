//! Blocking subprocess runner with output capture and cancellation
//!
//! External tools write stdout and stderr into a per-stage log file rather
//! than pipes, so a chatty aligner can never fill a pipe buffer and stall.
//! The caller blocks until the child exits; the cancel flag is polled so a
//! SIGINT turns into a kill of the child and a `Cancelled` outcome.
//!
//! Each child leads its own process group. Cancelling kills the group, so
//! processes started by a shell command line die with it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::shutdown;

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Process exited on its own. `code` is `None` when killed by a signal.
    Exited { code: Option<i32>, elapsed: Duration },
    /// Cancel flag was raised; the child was killed.
    Cancelled,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0), .. })
    }
}

/// Failure to start or supervise a child process.
#[derive(Debug)]
pub enum ProcessError {
    /// Could not open the log file for the child's output.
    Log { path: PathBuf, source: io::Error },
    /// `spawn` failed (program missing, not executable, ...).
    Spawn { program: String, source: io::Error },
    /// `try_wait` failed while supervising the child.
    Wait(io::Error),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Log { path, source } => write!(f, "cannot open log {}: {source}", path.display()),
            Self::Spawn { program, source } => write!(f, "cannot start {program}: {source}"),
            Self::Wait(e) => write!(f, "wait failed: {e}"),
        }
    }
}

impl std::error::Error for ProcessError {}

fn open_log(path: &Path) -> Result<File, ProcessError> {
    let log_err = |source| ProcessError::Log {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(log_err)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(log_err)
}

/// Run `command` to completion, appending its output to `log_path`.
///
/// `label` is written as a header line (usually the rendered command) so the
/// log reads as a transcript. `poll` is the cancel-check interval.
pub fn run_logged(
    command: &mut Command,
    label: &str,
    log_path: &Path,
    cancel: &AtomicBool,
    poll: Duration,
) -> Result<ProcessOutcome, ProcessError> {
    let mut log = open_log(log_path)?;
    let _ = writeln!(log, "$ {label}");
    let stdout = log.try_clone().map_err(|source| ProcessError::Log {
        path: log_path.to_path_buf(),
        source,
    })?;

    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(log))
        .process_group(0)
        .spawn()
        .map_err(|source| ProcessError::Spawn { program, source })?;
    shutdown::track_group(child.id());

    let started = Instant::now();
    loop {
        let status = match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                shutdown::untrack_group(child.id());
                return Err(ProcessError::Wait(e));
            }
        };
        if let Some(status) = status {
            shutdown::untrack_group(child.id());
            return Ok(ProcessOutcome::Exited {
                code: status.code(),
                elapsed: started.elapsed(),
            });
        }
        if cancel.load(Ordering::Relaxed) {
            log::warn!("cancel requested, killing process group {}", child.id());
            kill_group(&mut child);
            return Ok(ProcessOutcome::Cancelled);
        }
        std::thread::sleep(poll);
    }
}

/// Output of a command run by [`run_captured`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured {
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    Cancelled,
}

/// Run a short command and collect its output, killing it if `cancel` is
/// raised. Meant for counting commands whose stdout is a few bytes.
pub fn run_captured(
    command: &mut Command,
    cancel: &AtomicBool,
    poll: Duration,
) -> Result<Captured, ProcessError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|source| ProcessError::Spawn { program, source })?;
    shutdown::track_group(child.id());

    // drain both pipes so a chatty child never blocks on a full buffer
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let collect = |handle: Option<std::thread::JoinHandle<String>>| {
        handle.and_then(|h| h.join().ok()).unwrap_or_default()
    };

    loop {
        let status = child.try_wait().map_err(|e| {
            shutdown::untrack_group(child.id());
            ProcessError::Wait(e)
        })?;
        if let Some(status) = status {
            shutdown::untrack_group(child.id());
            return Ok(Captured::Exited {
                code: status.code(),
                stdout: collect(stdout),
                stderr: collect(stderr),
            });
        }
        if cancel.load(Ordering::Relaxed) {
            kill_group(&mut child);
            return Ok(Captured::Cancelled);
        }
        std::thread::sleep(poll);
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// SIGKILL the child's process group and reap the child.
fn kill_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg takes plain integers; the group is the one the child leads.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let _ = child.kill();
    }
    let _ = child.wait();
    shutdown::untrack_group(child.id());
}

/// Last `n` lines of a text file, for error diagnostics. Empty if unreadable.
pub fn tail_lines(path: &Path, n: usize) -> String {
    let Ok(content) = fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
