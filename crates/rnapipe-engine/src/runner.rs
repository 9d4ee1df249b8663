//! Run driver: lock → build → execute → finalize cleanup → release

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use rnapipe_core::SharedProgress;

use crate::checkpoint::CheckpointRecord;
use crate::cleanup::CleanupManager;
use crate::error::{PipelineError, Result};
use crate::executor::Executor;
use crate::graph::{GraphBuilder, SampleSpec};
use crate::lock::RunLock;
use crate::report::{MetricValue, ResultReporter};
use crate::run::{PipelineRun, RunFlags, RunIdentity, RunState};
use crate::stage::{Stage, StageId, StageStatus};

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub identity: RunIdentity,
    pub state: RunState,
    pub stages: Vec<(StageId, StageStatus)>,
    pub metrics: Vec<(String, MetricValue)>,
    /// Intermediates deleted at termination.
    pub removed: Vec<PathBuf>,
}

impl RunSummary {
    pub fn executed(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .filter(|(_, s)| {
                !matches!(
                    s,
                    StageStatus::Skipped | StageStatus::Pending | StageStatus::Blocked
                )
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn skipped(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .filter(|(_, s)| *s == StageStatus::Skipped)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Stages left out because an upstream fail-soft stage failed.
    pub fn blocked(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .filter(|(_, s)| *s == StageStatus::Blocked)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn status(&self, stage: StageId) -> Option<StageStatus> {
        self.stages.iter().find(|(id, _)| *id == stage).map(|(_, s)| *s)
    }

    pub fn metric(&self, key: &str) -> Option<&MetricValue> {
        self.metrics.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Drives whole runs for one sample at a time.
pub struct Runner<'a> {
    cancel: &'a AtomicBool,
    progress: Option<SharedProgress>,
    recover: bool,
    poll: Duration,
}

impl<'a> Runner<'a> {
    pub fn new(cancel: &'a AtomicBool) -> Self {
        Self {
            cancel,
            progress: None,
            recover: false,
            poll: Duration::from_millis(200),
        }
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Remove a stale lock before acquiring.
    pub fn with_recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Run the full pipeline for `sample`.
    pub fn run_sample(
        &self,
        builder: &GraphBuilder,
        sample: &SampleSpec,
        flags: RunFlags,
    ) -> Result<RunSummary> {
        if sample.name.trim().is_empty() {
            return Err(PipelineError::Configuration("sample name is empty".into()));
        }
        let statics = [
            ("Read_type", MetricValue::from(flags.read_type())),
            ("Genome", MetricValue::from(sample.genome.as_str())),
            ("Quantifier", MetricValue::from(builder.quantifier.name())),
        ];
        self.run_stages(sample.identity(), flags, &statics, || {
            builder.check_references(sample, flags)?;
            builder.build(sample, flags)
        })
    }

    /// Run an arbitrary stage list under the full lifecycle. `build` is
    /// called after the lock is held; its errors abort before any stage.
    pub fn run_stages(
        &self,
        identity: RunIdentity,
        flags: RunFlags,
        statics: &[(&str, MetricValue)],
        build: impl FnOnce() -> Result<Vec<Stage>>,
    ) -> Result<RunSummary> {
        let outdir = &identity.outdir;
        fs::create_dir_all(outdir).map_err(|e| PipelineError::io(outdir, e))?;

        if self.recover {
            RunLock::recover(outdir)?;
        }
        let lock = RunLock::acquire(outdir, &identity.sample)?;

        let stages = build()?;
        log::info!(
            "sample {}: {} stages ({})",
            identity.sample,
            stages.len(),
            stages.iter().map(|s| s.id.name()).collect::<Vec<_>>().join(" → ")
        );

        let mut checkpoint = CheckpointRecord::open(&identity, flags)?;
        if let Some(last) = checkpoint.last_completed {
            log::info!(
                "resuming attempt {} (last completed stage: {last})",
                checkpoint.attempts
            );
        }
        let mut results = ResultReporter::open(outdir)?;
        for (key, value) in statics {
            results.report(key, value.clone())?;
        }

        let mut cleanup = CleanupManager::from_stages(&stages);
        let mut run = PipelineRun::new(identity.clone(), flags, stages, results);

        let mut executor = Executor::new(self.cancel).with_poll(self.poll);
        if let Some(progress) = &self.progress {
            executor = executor.with_progress(progress.clone());
        }
        let outcome = executor.execute(&mut run, &mut checkpoint, &mut cleanup);

        let removed = cleanup.finalize(run.state());
        if let Err(e) = run.results().flush() {
            log::error!("cannot write metrics: {e}");
        }
        lock.release();
        outcome?;

        let summary = RunSummary {
            identity,
            state: run.state(),
            stages: run
                .stages()
                .iter()
                .map(|s| s.id)
                .zip(run.statuses().iter().copied())
                .collect(),
            metrics: run
                .results()
                .entries()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            removed,
        };
        log::info!(
            "sample {} {}: {} executed, {} skipped",
            summary.identity.sample,
            summary.state,
            summary.executed().len(),
            summary.skipped().len()
        );
        Ok(summary)
    }
}
