//! Error taxonomy for pipeline runs
//!
//! Configuration, lock and I/O errors abort before any checkpoint state is
//! written. Execution and validation errors abort after the checkpoint has
//! been persisted up to the last completed stage, so a re-run resumes.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::stage::StageId;

/// Exit code for an interrupted (resumable) run.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Exit code for every other fatal error.
pub const EXIT_FAILED: u8 = 1;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid or incompatible run-mode flags or missing resource reference.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another run holds the lock for this sample's output directory.
    #[error("run lock {} is held by {holder}", .path.display())]
    Lock { path: PathBuf, holder: String },

    /// External command failed on a stage that is not fail-soft.
    #[error(
        "stage {stage} failed ({status})\n  command: {command}\n  log: {}\n{diagnostic}",
        .log.display()
    )]
    Execution {
        stage: StageId,
        command: String,
        status: String,
        log: PathBuf,
        diagnostic: String,
    },

    /// Integrity check failed after a successful tool exit.
    #[error("stage {stage} failed validation: {failure}")]
    Validation {
        stage: StageId,
        #[source]
        failure: GateFailure,
    },

    /// Output directory or artifact path could not be created or written.
    #[error("I/O error on {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    /// A metric key was written twice within one run.
    #[error("metric {key:?} reported twice in one run")]
    Reporting { key: String },

    /// SIGINT/SIGTERM arrived; the checkpoint holds the last completed stage.
    #[error("run interrupted{}", interrupted_suffix(.stage))]
    Interrupted { stage: Option<StageId> },
}

fn interrupted_suffix(stage: &Option<StageId>) -> String {
    stage
        .map(|s| format!(" during stage {s} (resumable)"))
        .unwrap_or_else(|| " (resumable)".to_string())
}

/// Why a validation gate rejected a stage.
#[derive(Debug, Error)]
pub enum GateFailure {
    /// Silent data loss: counts differ across the representation change.
    #[error("{before_label} has {before} records but {after_label} has {after}")]
    Mismatch {
        before_label: String,
        before: u64,
        after_label: String,
        after: u64,
    },

    /// One side of the comparison could not be counted at all.
    #[error("cannot count {counter}: {reason}")]
    Unmeasurable { counter: String, reason: String },
}

impl PipelineError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Interrupted { .. } => EXIT_INTERRUPTED,
            _ => EXIT_FAILED,
        }
    }

    /// Whether progress was checkpointed and a re-run will resume.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Execution { .. } | Self::Validation { .. } | Self::Interrupted { .. }
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
