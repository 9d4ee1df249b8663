//! Checkpointed executor: walk the stage list, skip what is fresh, run the rest
//!
//! Skipping is decided from the filesystem alone. A stage is satisfied when
//! every declared output is fresh, or is missing only because the cleanup
//! manager reclaimed it after every consumer was itself satisfied. The
//! checkpoint record is written alongside for diagnosis and resume reporting.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rnapipe_core::{
    finish_stage_line, run_logged, tail_lines, ProcessError, ProcessOutcome, SharedProgress,
};

use crate::artifact::Freshness;
use crate::checkpoint::CheckpointRecord;
use crate::cleanup::CleanupManager;
use crate::error::{GateFailure, PipelineError, Result};
use crate::hash;
use crate::report::MetricValue;
use crate::run::{PipelineRun, RunState};
use crate::stage::{Stage, StageId, StageStatus};

/// Suffix appended to outputs of a stage that did not complete cleanly.
pub const INVALID_SUFFIX: &str = ".invalid";

/// Lines of the stage log attached to an execution error.
const DIAGNOSTIC_LINES: usize = 20;

/// Why a stage has to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    Forced,
    NoOutputs,
    Missing(PathBuf),
    Empty(PathBuf),
    Stale { output: PathBuf, input: PathBuf },
    /// An input was re-written earlier in this run.
    InputRebuilt(PathBuf),
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => f.write_str("forced"),
            Self::NoOutputs => f.write_str("no declared outputs"),
            Self::Missing(p) => write!(f, "{} missing", p.display()),
            Self::Empty(p) => write!(f, "{} empty", p.display()),
            Self::Stale { output, input } => {
                write!(f, "{} older than {}", output.display(), input.display())
            }
            Self::InputRebuilt(p) => write!(f, "{} rebuilt", p.display()),
        }
    }
}

/// Skip-or-run decision for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// All outputs present and up to date.
    Fresh,
    /// Some outputs were cleaned up after their consumers finished.
    Reclaimed,
    Run(RunReason),
}

impl Decision {
    pub fn is_satisfied(&self) -> bool {
        !matches!(self, Self::Run(_))
    }
}

/// Decide every stage against the current filesystem state, assuming each
/// stage that has to run succeeds. Used by `plan`.
pub fn assess(stages: &[Stage], cleanup: &CleanupManager) -> Vec<Decision> {
    let mut rebuilt = BTreeSet::new();
    let mut decisions = Vec::with_capacity(stages.len());
    for idx in 0..stages.len() {
        let mut memo = vec![None; stages.len()];
        let decision = decide(stages, idx, cleanup, &rebuilt, &mut memo);
        if !decision.is_satisfied() {
            rebuilt.extend(stages[idx].outputs.iter().map(|a| a.path().to_path_buf()));
        }
        decisions.push(decision);
    }
    decisions
}

fn decide(
    stages: &[Stage],
    idx: usize,
    cleanup: &CleanupManager,
    rebuilt: &BTreeSet<PathBuf>,
    memo: &mut [Option<Decision>],
) -> Decision {
    if let Some(decision) = &memo[idx] {
        return decision.clone();
    }
    let decision = decide_uncached(stages, idx, cleanup, rebuilt, memo);
    memo[idx] = Some(decision.clone());
    decision
}

fn decide_uncached(
    stages: &[Stage],
    idx: usize,
    cleanup: &CleanupManager,
    rebuilt: &BTreeSet<PathBuf>,
    memo: &mut [Option<Decision>],
) -> Decision {
    let stage = &stages[idx];
    if stage.force {
        return Decision::Run(RunReason::Forced);
    }
    if stage.outputs.is_empty() {
        return Decision::Run(RunReason::NoOutputs);
    }
    if let Some(input) = stage.inputs.iter().find(|p| rebuilt.contains(*p)) {
        return Decision::Run(RunReason::InputRebuilt(input.clone()));
    }

    let mut reclaimed = false;
    for artifact in &stage.outputs {
        let path = artifact.path();
        match artifact.freshness(&stage.inputs) {
            Freshness::Fresh => {}
            Freshness::Missing if cleanup.covers(path) => {
                let consumers_satisfied = (idx + 1..stages.len())
                    .filter(|&j| stages[j].consumes(path))
                    .all(|j| decide(stages, j, cleanup, rebuilt, memo).is_satisfied());
                if !consumers_satisfied {
                    return Decision::Run(RunReason::Missing(path.to_path_buf()));
                }
                reclaimed = true;
            }
            Freshness::Missing => return Decision::Run(RunReason::Missing(path.to_path_buf())),
            Freshness::Empty => return Decision::Run(RunReason::Empty(path.to_path_buf())),
            Freshness::Stale { newer_input } => {
                return Decision::Run(RunReason::Stale {
                    output: path.to_path_buf(),
                    input: newer_input,
                });
            }
        }
    }
    if reclaimed {
        Decision::Reclaimed
    } else {
        Decision::Fresh
    }
}

/// How the commands of one stage ended.
enum StageOutcome {
    Succeeded,
    Failed {
        command: String,
        status: String,
        exit_code: MetricValue,
    },
    Cancelled,
}

/// Sequential stage runner bound to a cancel flag.
pub struct Executor<'a> {
    cancel: &'a AtomicBool,
    progress: Option<SharedProgress>,
    poll: Duration,
}

impl<'a> Executor<'a> {
    pub fn new(cancel: &'a AtomicBool) -> Self {
        Self {
            cancel,
            progress: None,
            poll: Duration::from_millis(200),
        }
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Interval at which a running child is checked for cancellation.
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Execute every stage of `run` in order.
    ///
    /// On return the run is in a terminal state and the checkpoint has been
    /// saved. Conditional cleanup is left to the caller.
    pub fn execute(
        &self,
        run: &mut PipelineRun,
        checkpoint: &mut CheckpointRecord,
        cleanup: &mut CleanupManager,
    ) -> Result<()> {
        run.start();
        if let Some(id) = checkpoint.in_progress {
            // previous process died without unwinding
            if let Some(stage) = run.stages().iter().find(|s| s.id == id) {
                log::warn!("{id}: previous run ended while it was running, discarding its outputs");
                quarantine(stage);
            }
            checkpoint.revoke(id);
            checkpoint.settle();
        }
        checkpoint.set_state(RunState::Running);
        if let Err(e) = checkpoint.save() {
            return Self::abort(run, checkpoint, e);
        }

        let logs = run.identity().outdir.join("logs");
        let mut rebuilt: BTreeSet<PathBuf> = BTreeSet::new();
        // outputs of soft-failed or blocked stages in this run
        let mut unavailable: BTreeSet<PathBuf> = BTreeSet::new();

        for idx in 0..run.stages().len() {
            if self.cancel.load(Ordering::Relaxed) {
                return Self::interrupt(run, checkpoint, None);
            }
            let stage = run.stages()[idx].clone();

            if let Some(missing) = stage.inputs.iter().find(|p| unavailable.contains(*p)) {
                log::warn!(
                    "{}: blocked, {} was not produced in this run",
                    stage.id,
                    missing.display()
                );
                run.set_status(idx, StageStatus::Blocked);
                unavailable.extend(stage.outputs.iter().map(|a| a.path().to_path_buf()));
                checkpoint.revoke(stage.id);
                let reported = run
                    .results_mut()
                    .report(&exit_code_key(stage.id), BLOCKED)
                    .and_then(|()| checkpoint.save());
                if let Err(e) = reported {
                    return Self::abort(run, checkpoint, e);
                }
                continue;
            }
            let mut memo = vec![None; run.stages().len()];
            let reason = match decide(run.stages(), idx, cleanup, &rebuilt, &mut memo) {
                Decision::Run(reason) => reason,
                decision => {
                    log::info!(
                        "{}: skipped ({})",
                        stage.id,
                        if decision == Decision::Fresh { "fresh" } else { "reclaimed" }
                    );
                    run.set_status(idx, StageStatus::Skipped);
                    cleanup.reclaim(&run.settled());
                    continue;
                }
            };

            log::info!("{}: running ({reason})", stage.id);
            checkpoint.begin(stage.id);
            if let Err(e) = prepare_outputs(&stage).and_then(|()| checkpoint.save()) {
                return Self::abort(run, checkpoint, e);
            }
            let log_path = logs.join(format!("{}.log", stage.id));
            let line = self.progress.as_ref().map(|p| p.stage_line(stage.id.name()));

            let outcome = match self.run_commands(&stage, &log_path) {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Some(pb) = &line {
                        finish_stage_line(pb, "error");
                    }
                    return Self::abort(run, checkpoint, e);
                }
            };

            match outcome {
                StageOutcome::Cancelled => {
                    if let Some(pb) = &line {
                        finish_stage_line(pb, "interrupted");
                    }
                    quarantine(&stage);
                    checkpoint.settle();
                    return Self::interrupt(run, checkpoint, Some(stage.id));
                }
                StageOutcome::Failed {
                    command,
                    status,
                    exit_code,
                } => {
                    quarantine(&stage);
                    checkpoint.settle();
                    if stage.fail_soft {
                        unavailable.extend(stage.outputs.iter().map(|a| a.path().to_path_buf()));
                        if let Some(pb) = &line {
                            finish_stage_line(pb, "failed (soft)");
                        }
                        log::warn!(
                            "{}: {command} {status}, continuing (see {})",
                            stage.id,
                            log_path.display()
                        );
                        run.set_status(idx, StageStatus::SoftFailed);
                        let reported = run
                            .results_mut()
                            .report(&exit_code_key(stage.id), exit_code)
                            .and_then(|()| checkpoint.save());
                        if let Err(e) = reported {
                            return Self::abort(run, checkpoint, e);
                        }
                        continue;
                    }
                    if let Some(pb) = &line {
                        finish_stage_line(pb, "failed");
                    }
                    run.set_status(idx, StageStatus::Failed);
                    let err = PipelineError::Execution {
                        stage: stage.id,
                        command,
                        status,
                        diagnostic: tail_lines(&log_path, DIAGNOSTIC_LINES),
                        log: log_path,
                    };
                    return Self::abort(run, checkpoint, err);
                }
                StageOutcome::Succeeded => {}
            }

            run.set_status(idx, StageStatus::Completed);
            checkpoint.mark_completed(stage.id, hash::fingerprint(&stage));
            if let Err(e) = checkpoint.save() {
                return Self::abort(run, checkpoint, e);
            }
            rebuilt.extend(stage.outputs.iter().map(|a| a.path().to_path_buf()));

            if let Err(e) = self.follow(run, &stage) {
                match e {
                    // gate cut short: outputs stay unverified
                    PipelineError::Interrupted { .. } => {
                        if let Some(pb) = &line {
                            finish_stage_line(pb, "interrupted");
                        }
                        run.set_status(idx, StageStatus::Pending);
                        checkpoint.revoke(stage.id);
                        quarantine(&stage);
                        checkpoint.settle();
                        return Self::interrupt(run, checkpoint, Some(stage.id));
                    }
                    PipelineError::Validation { .. } => {
                        run.set_status(idx, StageStatus::Failed);
                        checkpoint.revoke(stage.id);
                        quarantine(&stage);
                        checkpoint.settle();
                    }
                    // outputs stay unverified; the next run moves them aside
                    _ => {}
                }
                if let Some(pb) = &line {
                    finish_stage_line(pb, "invalid");
                }
                return Self::abort(run, checkpoint, e);
            }
            checkpoint.settle();
            if let Err(e) = checkpoint.save() {
                return Self::abort(run, checkpoint, e);
            }
            if let Some(pb) = &line {
                finish_stage_line(pb, "done");
            }
            cleanup.reclaim(&run.settled());
        }

        run.finish(RunState::Completed);
        checkpoint.set_state(RunState::Completed);
        checkpoint.save()
    }

    /// Run the stage's commands in order; the first failure stops the stage.
    fn run_commands(&self, stage: &Stage, log_path: &Path) -> Result<StageOutcome> {
        for spec in &stage.commands {
            let rendered = spec.render();
            log::debug!("{}: $ {rendered}", stage.id);
            let result = run_logged(
                &mut spec.to_command(),
                &rendered,
                log_path,
                self.cancel,
                self.poll,
            );
            let (status, exit_code) = match result {
                Ok(outcome) if outcome.success() => continue,
                Ok(ProcessOutcome::Cancelled) => return Ok(StageOutcome::Cancelled),
                Ok(ProcessOutcome::Exited { code: Some(code), .. }) => {
                    (
                        format!("exited with code {code}"),
                        MetricValue::Int(u64::from(code.unsigned_abs())),
                    )
                }
                Ok(ProcessOutcome::Exited { code: None, .. }) => {
                    ("killed by signal".to_string(), MetricValue::from("signal"))
                }
                Err(ProcessError::Spawn { program, source }) => {
                    (format!("could not start {program}: {source}"), MetricValue::from("spawn"))
                }
                Err(ProcessError::Log { path, source }) => {
                    return Err(PipelineError::io(path, source));
                }
                Err(ProcessError::Wait(source)) => {
                    return Err(PipelineError::io(log_path, source));
                }
            };
            return Ok(StageOutcome::Failed {
                command: rendered,
                status,
                exit_code,
            });
        }
        Ok(StageOutcome::Succeeded)
    }

    /// Post-completion hooks: validation gate, then metric probes.
    fn follow(&self, run: &mut PipelineRun, stage: &Stage) -> Result<()> {
        if let Some(gate) = &stage.validation {
            let reading = match gate.measure(self.cancel) {
                Ok(reading) => reading,
                Err(_) if self.cancel.load(Ordering::Relaxed) => {
                    return Err(PipelineError::Interrupted {
                        stage: Some(stage.id),
                    });
                }
                Err(failure) => {
                    return Err(PipelineError::Validation {
                        stage: stage.id,
                        failure,
                    });
                }
            };
            if let Some(key) = &gate.before_key {
                run.results_mut().report(key, reading.before)?;
            }
            if let Some(key) = &gate.after_key {
                run.results_mut().report(key, reading.after)?;
            }
            gate.verify(reading).map_err(|failure: GateFailure| {
                PipelineError::Validation {
                    stage: stage.id,
                    failure,
                }
            })?;
            log::info!("{}: validated {} records", stage.id, reading.after);
        }

        for probe in &stage.metrics {
            match probe.measure(self.cancel) {
                Ok(value) => run.results_mut().report(&probe.key, value)?,
                Err(reason) => log::warn!("{}: cannot measure {}: {reason}", stage.id, probe.key),
            }
        }

        // clear a failure or block recorded by an earlier run
        let key = exit_code_key(stage.id);
        if run.results().get(&key).is_some() {
            run.results_mut().report(&key, 0u64)?;
        }
        Ok(())
    }

    fn abort(run: &mut PipelineRun, checkpoint: &mut CheckpointRecord, err: PipelineError) -> Result<()> {
        log::error!("{err}");
        run.finish(RunState::Failed);
        checkpoint.set_state(RunState::Failed);
        if let Err(save) = checkpoint.save() {
            log::error!("cannot save checkpoint: {save}");
        }
        Err(err)
    }

    fn interrupt(
        run: &mut PipelineRun,
        checkpoint: &mut CheckpointRecord,
        stage: Option<StageId>,
    ) -> Result<()> {
        run.finish(RunState::Interrupted);
        checkpoint.set_state(RunState::Interrupted);
        checkpoint.save()?;
        let err = PipelineError::Interrupted { stage };
        log::warn!("{err}");
        Err(err)
    }
}

/// Exit-code metric value of a stage that was blocked by a soft failure.
pub const BLOCKED: &str = "blocked";

/// Metric recording the exit status of a fail-soft stage, or [`BLOCKED`].
pub fn exit_code_key(stage: StageId) -> String {
    format!("{stage}_exit_code")
}

fn prepare_outputs(stage: &Stage) -> Result<()> {
    for artifact in &stage.outputs {
        if let Some(parent) = artifact.path().parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
    }
    Ok(())
}

/// Rename outputs so a partial or rejected artifact can never look fresh.
fn quarantine(stage: &Stage) {
    for artifact in &stage.outputs {
        let path = artifact.path();
        if fs::symlink_metadata(path).is_err() {
            continue;
        }
        let mut target = path.as_os_str().to_owned();
        target.push(INVALID_SUFFIX);
        let target = PathBuf::from(target);
        match fs::rename(path, &target) {
            Ok(()) => log::warn!("{}: moved {} aside", stage.id, target.display()),
            Err(e) => log::warn!("{}: cannot move {} aside: {e}", stage.id, path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupEntry;
    use crate::stage::CommandSpec;

    fn write(path: &Path) -> CommandSpec {
        CommandSpec::shell(format!("echo data > {}", path.display()))
    }

    #[test]
    fn fresh_and_missing_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "x").unwrap();
        let stages = vec![
            Stage::new(StageId::MergeLink).command(write(&a)).output(&a),
            Stage::new(StageId::FastqConversion).command(write(&b)).input(&a).output(&b),
        ];
        let cleanup = CleanupManager::from_stages(&stages);
        let decisions = assess(&stages, &cleanup);
        assert_eq!(decisions[0], Decision::Fresh);
        assert_eq!(decisions[1], Decision::Run(RunReason::Missing(b)));
    }

    #[test]
    fn reclaimed_output_is_satisfied_only_through_consumers() {
        let dir = tempfile::tempdir().unwrap();
        let sam = dir.path().join("s.sam");
        let bam = dir.path().join("s.bam");
        let stages = vec![
            Stage::new(StageId::Align).command(write(&sam)).output(&sam),
            Stage::new(StageId::Sort)
                .command(write(&bam))
                .input(&sam)
                .output(&bam)
                .clean(CleanupEntry::unconditional(&sam)),
        ];
        let cleanup = CleanupManager::from_stages(&stages);

        // consumer output missing as well: everything runs
        let decisions = assess(&stages, &cleanup);
        assert!(!decisions[0].is_satisfied());

        // consumer output present: the missing SAM was reclaimed
        fs::write(&bam, "x").unwrap();
        let decisions = assess(&stages, &cleanup);
        assert_eq!(decisions, vec![Decision::Reclaimed, Decision::Fresh]);
    }

    #[test]
    fn forced_and_outputless_stages_run() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::write(&a, "x").unwrap();
        let stages = vec![
            Stage::new(StageId::MergeLink).output(&a).force(true),
            Stage::new(StageId::Trim),
        ];
        let decisions = assess(&stages, &CleanupManager::default());
        assert_eq!(decisions[0], Decision::Run(RunReason::Forced));
        assert_eq!(decisions[1], Decision::Run(RunReason::NoOutputs));
    }

    #[test]
    fn rerun_cascades_to_consumers() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&b, "x").unwrap();
        let stages = vec![
            Stage::new(StageId::MergeLink).command(write(&a)).output(&a),
            Stage::new(StageId::FastqConversion).command(write(&b)).input(&a).output(&b),
        ];
        let decisions = assess(&stages, &CleanupManager::default());
        assert_eq!(decisions[0], Decision::Run(RunReason::Missing(a.clone())));
        assert_eq!(decisions[1], Decision::Run(RunReason::InputRebuilt(a)));
    }

    #[test]
    fn quarantine_renames_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("s.fastq");
        fs::write(&out, "partial").unwrap();
        let stage = Stage::new(StageId::FastqConversion)
            .output(&out)
            .output(dir.path().join("never-written"));
        quarantine(&stage);
        assert!(!out.exists());
        assert!(dir.path().join("s.fastq.invalid").exists());
    }

    #[test]
    fn exit_code_metric_key() {
        assert_eq!(exit_code_key(StageId::ErccQuantify), "ercc_quantify_exit_code");
    }
}
