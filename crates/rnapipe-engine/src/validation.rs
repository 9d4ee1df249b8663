//! Validation gate: compare record counts across a representation change
//!
//! A zero exit status from a converter does not prove nothing was dropped.
//! The gate counts the same logical reads before and after the stage and
//! rejects the stage when the numbers differ.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use rnapipe_core::{run_captured, Captured};

use crate::error::GateFailure;
use crate::stage::CommandSpec;

/// A way of counting records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Counter {
    /// FASTQ records summed over all files (gzip detected by extension).
    FastqRecords(Vec<PathBuf>),
    /// External command printing a single integer, e.g. `samtools view -c`.
    Command { label: String, command: CommandSpec },
}

impl Counter {
    pub fn fastq<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>) -> Self {
        Self::FastqRecords(paths.into_iter().map(Into::into).collect())
    }

    pub fn command(label: impl Into<String>, command: CommandSpec) -> Self {
        Self::Command {
            label: label.into(),
            command,
        }
    }

    /// Short description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::FastqRecords(paths) => paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" + "),
            Self::Command { label, .. } => label.clone(),
        }
    }

    /// Count records. A counting command is killed when `cancel` is raised.
    pub fn count(&self, cancel: &AtomicBool) -> Result<u64, String> {
        match self {
            Self::FastqRecords(paths) => {
                let mut total = 0;
                for path in paths {
                    total += count_fastq_records(path)
                        .map_err(|e| format!("{}: {e}", path.display()))?;
                }
                Ok(total)
            }
            Self::Command { command, .. } => count_from_command(command, cancel),
        }
    }
}

/// Count FASTQ records (4 lines each) in a plain or gzipped file.
pub fn count_fastq_records(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let is_gz = path.extension().is_some_and(|ext| ext == "gz");
    let lines = if is_gz {
        count_lines(MultiGzDecoder::new(BufReader::new(file)))?
    } else {
        count_lines(BufReader::new(file))?
    };
    if lines % 4 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("truncated FASTQ: {lines} lines is not a multiple of 4"),
        ));
    }
    Ok(lines / 4)
}

/// Count lines, treating a final line without trailing newline as a line.
fn count_lines(mut reader: impl Read) -> io::Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut lines = 0u64;
    let mut last = b'\n';
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
        last = buf[n - 1];
    }
    if last != b'\n' {
        lines += 1;
    }
    Ok(lines)
}

/// Cancel-check interval for counting commands.
const COUNT_POLL: Duration = Duration::from_millis(100);

fn count_from_command(command: &CommandSpec, cancel: &AtomicBool) -> Result<u64, String> {
    let captured = run_captured(&mut command.to_command(), cancel, COUNT_POLL)
        .map_err(|e| format!("cannot run `{command}`: {e}"))?;
    let stdout = match captured {
        Captured::Cancelled => return Err(format!("`{command}` cancelled")),
        Captured::Exited { code: Some(0), stdout, .. } => stdout,
        Captured::Exited { code, stderr, .. } => {
            let status = code.map_or("a signal".to_string(), |c| format!("code {c}"));
            return Err(format!("`{command}` exited with {status}: {}", stderr.trim()));
        }
    };
    let first = stdout.split_whitespace().next().unwrap_or("");
    first
        .parse::<u64>()
        .map_err(|_| format!("`{command}` printed {:?}, expected a count", stdout.trim()))
}

/// Counts observed by a gate, before and after the stage's conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateReading {
    pub before: u64,
    pub after: u64,
}

/// Post-condition attached to a stage.
///
/// `before_key`/`after_key`, when set, publish both counts as run metrics
/// whether or not they match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationGate {
    pub before: Counter,
    pub after: Counter,
    pub before_key: Option<String>,
    pub after_key: Option<String>,
}

impl ValidationGate {
    pub fn new(before: Counter, after: Counter) -> Self {
        Self {
            before,
            after,
            before_key: None,
            after_key: None,
        }
    }

    pub fn report_as(mut self, before_key: impl Into<String>, after_key: impl Into<String>) -> Self {
        self.before_key = Some(before_key.into());
        self.after_key = Some(after_key.into());
        self
    }

    /// Count both sides.
    pub fn measure(&self, cancel: &AtomicBool) -> Result<GateReading, GateFailure> {
        let count = |counter: &Counter| {
            counter.count(cancel).map_err(|reason| GateFailure::Unmeasurable {
                counter: counter.describe(),
                reason,
            })
        };
        Ok(GateReading {
            before: count(&self.before)?,
            after: count(&self.after)?,
        })
    }

    /// Reject a reading whose counts differ.
    pub fn verify(&self, reading: GateReading) -> Result<(), GateFailure> {
        if reading.before == reading.after {
            return Ok(());
        }
        Err(GateFailure::Mismatch {
            before_label: self.before.describe(),
            before: reading.before,
            after_label: self.after.describe(),
            after: reading.after,
        })
    }
}
