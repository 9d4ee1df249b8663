//! PipelineRun: one execution instance and its lifecycle

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::report::ResultReporter;
use crate::stage::{Stage, StageId, StageStatus};

/// Identity of a run: one sample in one output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub sample: String,
    /// Sample output directory (`<output parent>/<sample>`).
    pub outdir: PathBuf,
}

impl RunIdentity {
    pub fn new(sample: impl Into<String>, output_parent: &Path) -> Self {
        let sample = sample.into();
        let outdir = output_parent.join(&sample);
        Self { sample, outdir }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.sample, self.outdir.display())
    }
}

/// Run-mode flags that select the stage graph topology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunFlags {
    /// Paired-end read layout.
    pub paired: bool,
    /// Bisulfite read filtering after alignment.
    pub filter_enabled: bool,
    /// Spike-in (ERCC) sub-graph.
    pub ercc_enabled: bool,
    /// CORE-seq trimming parameters.
    pub coreseq_mode: bool,
}

impl RunFlags {
    /// Every flag combination, in a fixed order.
    pub fn all() -> Vec<RunFlags> {
        (0u8..16)
            .map(|bits| RunFlags {
                paired: bits & 1 != 0,
                filter_enabled: bits & 2 != 0,
                ercc_enabled: bits & 4 != 0,
                coreseq_mode: bits & 8 != 0,
            })
            .collect()
    }

    pub fn read_type(&self) -> &'static str {
        if self.paired { "paired" } else { "single" }
    }
}

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// One execution instance: stage list, per-stage status, metrics, state.
///
/// Owned by the caller and passed explicitly to the executor; all mutation
/// goes through the methods below.
#[derive(Debug)]
pub struct PipelineRun {
    identity: RunIdentity,
    flags: RunFlags,
    stages: Vec<Stage>,
    statuses: Vec<StageStatus>,
    state: RunState,
    results: ResultReporter,
}

impl PipelineRun {
    pub fn new(
        identity: RunIdentity,
        flags: RunFlags,
        stages: Vec<Stage>,
        results: ResultReporter,
    ) -> Self {
        let statuses = vec![StageStatus::Pending; stages.len()];
        Self {
            identity,
            flags,
            stages,
            statuses,
            state: RunState::Pending,
            results,
        }
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    pub fn flags(&self) -> RunFlags {
        self.flags
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn results(&self) -> &ResultReporter {
        &self.results
    }

    pub fn results_mut(&mut self) -> &mut ResultReporter {
        &mut self.results
    }

    pub fn status(&self, idx: usize) -> StageStatus {
        self.statuses[idx]
    }

    pub fn statuses(&self) -> &[StageStatus] {
        &self.statuses
    }

    pub(crate) fn set_status(&mut self, idx: usize, status: StageStatus) {
        self.statuses[idx] = status;
    }

    /// `settled[i]`: stage `i` completed or was skipped in this run.
    pub fn settled(&self) -> Vec<bool> {
        self.statuses.iter().map(|s| s.is_settled()).collect()
    }

    /// Stages whose commands were invoked in this run, in order.
    pub fn executed(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .zip(&self.statuses)
            .filter(|(_, s)| {
                matches!(
                    s,
                    StageStatus::Completed | StageStatus::SoftFailed | StageStatus::Failed
                )
            })
            .map(|(stage, _)| stage.id)
            .collect()
    }

    pub fn skipped(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .zip(&self.statuses)
            .filter(|(_, s)| **s == StageStatus::Skipped)
            .map(|(stage, _)| stage.id)
            .collect()
    }

    /// `pending → running`.
    pub(crate) fn start(&mut self) {
        debug_assert_eq!(self.state, RunState::Pending);
        self.state = RunState::Running;
    }

    /// Enter a terminal state. Only the first call has an effect.
    pub(crate) fn finish(&mut self, state: RunState) {
        debug_assert!(state.is_terminal());
        if self.state.is_terminal() {
            log::error!(
                "run {} already {}, ignoring transition to {state}",
                self.identity.sample,
                self.state
            );
            return;
        }
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn all_flag_combinations_are_distinct() {
        let all = RunFlags::all();
        assert_eq!(all.len(), 16);
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), 16);
    }

    #[test]
    fn identity_nests_sample_under_parent() {
        let id = RunIdentity::new("s1", Path::new("/data/out"));
        assert_eq!(id.outdir, PathBuf::from("/data/out/s1"));
        assert_eq!(id.to_string(), "s1 (/data/out/s1)");
    }

    #[test]
    fn terminal_state_is_entered_once() {
        let mut run = PipelineRun::new(
            RunIdentity::new("s1", Path::new("/tmp")),
            RunFlags::default(),
            vec![Stage::new(StageId::MergeLink)],
            ResultReporter::new(),
        );
        assert_eq!(run.state(), RunState::Pending);
        run.start();
        run.finish(RunState::Failed);
        run.finish(RunState::Completed);
        assert_eq!(run.state(), RunState::Failed);
    }

    #[test]
    fn executed_and_skipped_partition_by_status() {
        let mut run = PipelineRun::new(
            RunIdentity::new("s1", Path::new("/tmp")),
            RunFlags::default(),
            vec![
                Stage::new(StageId::MergeLink),
                Stage::new(StageId::FastqConversion),
                Stage::new(StageId::Trim),
            ],
            ResultReporter::new(),
        );
        run.set_status(0, StageStatus::Skipped);
        run.set_status(1, StageStatus::Completed);
        run.set_status(2, StageStatus::SoftFailed);
        assert_eq!(run.skipped(), vec![StageId::MergeLink]);
        assert_eq!(run.executed(), vec![StageId::FastqConversion, StageId::Trim]);
        assert_eq!(run.settled(), vec![true, true, false]);
    }
}
