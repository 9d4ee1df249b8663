//! Checkpoint record: persisted stage-completion markers
//!
//! Stored as `checkpoint.json` in the sample output directory. The record is
//! diagnostic: stage skipping is decided from artifact freshness, never by
//! reading this file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::run::{RunFlags, RunIdentity, RunState};
use crate::stage::StageId;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Completion marker for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMark {
    pub completed_at: DateTime<Utc>,
    /// Blake3 fingerprint of the command list that produced the outputs.
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub sample: String,
    pub outdir: PathBuf,
    pub flags: RunFlags,
    pub state: RunState,
    /// Number of invocations that opened this record.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed: BTreeMap<StageId, StageMark>,
    /// Most recently completed stage.
    #[serde(default)]
    pub last_completed: Option<StageId>,
    /// Stage whose outputs were being written and not yet verified. Set
    /// when a run was killed without unwinding.
    #[serde(default)]
    pub in_progress: Option<StageId>,
    #[serde(skip)]
    path: PathBuf,
}

impl CheckpointRecord {
    /// Load the record for `identity`, or start a fresh one. The record is
    /// consulted, not recreated: completion markers from earlier attempts
    /// are kept.
    pub fn open(identity: &RunIdentity, flags: RunFlags) -> Result<Self> {
        let path = identity.outdir.join(CHECKPOINT_FILE);
        let now = Utc::now();
        let mut record = match Self::load(&identity.outdir)? {
            Some(mut existing) => {
                if existing.sample != identity.sample {
                    return Err(PipelineError::Configuration(format!(
                        "{} belongs to sample {:?}, not {:?}",
                        path.display(),
                        existing.sample,
                        identity.sample
                    )));
                }
                if existing.flags != flags {
                    log::info!("run flags changed since the previous attempt");
                    existing.flags = flags;
                }
                existing
            }
            None => Self {
                sample: identity.sample.clone(),
                outdir: identity.outdir.clone(),
                flags,
                state: RunState::Pending,
                attempts: 0,
                created_at: now,
                updated_at: now,
                completed: BTreeMap::new(),
                last_completed: None,
                in_progress: None,
                path: path.clone(),
            },
        };
        record.attempts += 1;
        record.state = RunState::Running;
        record.path = path;
        log::debug!(
            "checkpoint attempt {} ({} stages previously completed)",
            record.attempts,
            record.completed.len()
        );
        Ok(record)
    }

    /// Read `outdir/checkpoint.json` without modifying it.
    pub fn load(outdir: &Path) -> Result<Option<Self>> {
        let path = outdir.join(CHECKPOINT_FILE);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::io(&path, e)),
        };
        let mut record: Self = serde_json::from_str(&json).map_err(|e| {
            PipelineError::io(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        record.path = path;
        Ok(Some(record))
    }

    pub fn mark_completed(&mut self, stage: StageId, fingerprint: String) {
        let now = Utc::now();
        self.completed.insert(
            stage,
            StageMark {
                completed_at: now,
                fingerprint,
            },
        );
        self.last_completed = Some(stage);
        self.updated_at = now;
    }

    /// Note that `stage` is about to write its outputs.
    pub fn begin(&mut self, stage: StageId) {
        self.in_progress = Some(stage);
        self.updated_at = Utc::now();
    }

    /// Clear the in-progress marker once the stage's outputs are verified
    /// or moved aside.
    pub fn settle(&mut self) {
        self.in_progress = None;
    }

    /// Drop the completion marker of a stage whose outputs were rejected.
    pub fn revoke(&mut self, stage: StageId) {
        self.completed.remove(&stage);
        if self.last_completed == Some(stage) {
            self.last_completed = self
                .completed
                .iter()
                .max_by_key(|(_, mark)| mark.completed_at)
                .map(|(id, _)| *id);
        }
        self.updated_at = Utc::now();
    }

    pub fn set_state(&mut self, state: RunState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn is_completed(&self, stage: StageId) -> bool {
        self.completed.contains_key(&stage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write atomically (tmp → rename).
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::io(&self.path, std::io::Error::other(e)))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| PipelineError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| PipelineError::io(&self.path, e))?;
        Ok(())
    }
}
