use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rnapipe_engine::{
    CheckpointRecord, CleanupEntry, CommandSpec, Counter, GateFailure, MetricProbe, MetricValue,
    PipelineError, ResultReporter, RunFlags, RunIdentity, RunLock, RunState, RunSummary, Runner,
    Stage, StageId, StageStatus, ValidationGate, BLOCKED, EXIT_INTERRUPTED, LOCK_FILE, STATS_FILE,
};
use tempfile::TempDir;

/// A sample directory plus a journal recording which stage commands ran.
struct Toy {
    _dir: TempDir,
    input: PathBuf,
    journal: PathBuf,
    identity: RunIdentity,
}

impl Toy {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "reads\n").unwrap();
        let journal = dir.path().join("journal");
        let identity = RunIdentity::new("s1", &dir.path().join("out"));
        Self {
            _dir: dir,
            input,
            journal,
            identity,
        }
    }

    fn outdir(&self) -> &Path {
        &self.identity.outdir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.outdir().join(name)
    }

    /// Stage that journals its id, then concatenates `inputs` into `output`.
    fn step(&self, id: StageId, inputs: &[&Path], output: &Path) -> Stage {
        self.guarded(id, None, inputs, output)
    }

    /// Like `step`, but fails unless `gate` exists.
    fn guarded(&self, id: StageId, gate: Option<&Path>, inputs: &[&Path], output: &Path) -> Stage {
        let srcs: Vec<String> = inputs.iter().map(|p| p.display().to_string()).collect();
        let check = gate
            .map(|g| format!("test -e {} && ", g.display()))
            .unwrap_or_default();
        let line = format!(
            "{check}echo {id} >> {} && cat {} > {}",
            self.journal.display(),
            srcs.join(" "),
            output.display()
        );
        Stage::new(id)
            .command(CommandSpec::shell(line))
            .inputs(inputs.iter().copied())
            .output(output)
    }

    /// Four-stage linear chain rooted at the external input.
    fn chain(&self) -> Vec<Stage> {
        let (a, b, c, d) = (self.path("a.txt"), self.path("b.txt"), self.path("c.txt"), self.path("d.txt"));
        vec![
            self.step(StageId::MergeLink, &[&self.input], &a),
            self.step(StageId::FastqConversion, &[&a], &b)
                .metric(MetricProbe::file_size_mb("File_mb", [&a])),
            self.step(StageId::Trim, &[&b], &c),
            self.step(StageId::Align, &[&c], &d),
        ]
    }

    fn journal(&self) -> Vec<String> {
        fs::read_to_string(&self.journal)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn checkpoint(&self) -> CheckpointRecord {
        CheckpointRecord::load(self.outdir()).unwrap().unwrap()
    }

    fn stats(&self) -> ResultReporter {
        ResultReporter::open(self.outdir()).unwrap()
    }

    fn run(&self, stages: Vec<Stage>) -> Result<RunSummary, PipelineError> {
        self.run_with(&AtomicBool::new(false), stages)
    }

    fn run_with(&self, cancel: &AtomicBool, stages: Vec<Stage>) -> Result<RunSummary, PipelineError> {
        Runner::new(cancel)
            .with_poll(Duration::from_millis(10))
            .run_stages(
                self.identity.clone(),
                RunFlags::default(),
                &[("Genome", MetricValue::from("toy"))],
                || Ok(stages),
            )
    }
}

// ============================================================
// Idempotence and resumption
// ============================================================

#[test]
fn second_run_executes_nothing() {
    let toy = Toy::new();

    let first = toy.run(toy.chain()).unwrap();
    assert_eq!(first.state, RunState::Completed);
    assert_eq!(first.executed().len(), 4);
    assert_eq!(toy.journal(), ["merge_link", "fastq_conversion", "trim", "align"]);
    let stats = fs::read_to_string(toy.path(STATS_FILE)).unwrap();

    let second = toy.run(toy.chain()).unwrap();
    assert_eq!(second.state, RunState::Completed);
    assert!(second.executed().is_empty());
    assert_eq!(second.skipped().len(), 4);
    assert_eq!(toy.journal().len(), 4, "no command may run twice");
    assert_eq!(fs::read_to_string(toy.path(STATS_FILE)).unwrap(), stats);

    let checkpoint = toy.checkpoint();
    assert_eq!(checkpoint.attempts, 2);
    assert_eq!(checkpoint.state, RunState::Completed);
    assert_eq!(checkpoint.last_completed, Some(StageId::Align));
}

#[test]
fn failed_run_resumes_after_last_completed_stage() {
    let toy = Toy::new();
    let gate = toy.path("gate");
    let (a, b, c) = (toy.path("a.txt"), toy.path("b.txt"), toy.path("c.txt"));
    let stages = || {
        vec![
            toy.step(StageId::MergeLink, &[&toy.input], &a),
            toy.guarded(StageId::Trim, Some(&gate), &[&a], &b),
            toy.step(StageId::Align, &[&b], &c),
        ]
    };

    let err = toy.run(stages()).unwrap_err();
    match &err {
        PipelineError::Execution { stage, log, .. } => {
            assert_eq!(*stage, StageId::Trim);
            assert!(log.ends_with("logs/trim.log"));
        }
        other => panic!("expected execution error, got {other:?}"),
    }
    assert!(err.is_resumable());
    assert_eq!(toy.journal(), ["merge_link"]);
    let checkpoint = toy.checkpoint();
    assert_eq!(checkpoint.state, RunState::Failed);
    assert_eq!(checkpoint.last_completed, Some(StageId::MergeLink));
    assert!(!toy.path(LOCK_FILE).exists());

    fs::write(&gate, "").unwrap();
    let summary = toy.run(stages()).unwrap();
    assert_eq!(summary.skipped(), [StageId::MergeLink]);
    assert_eq!(summary.executed(), [StageId::Trim, StageId::Align]);
    assert_eq!(toy.journal(), ["merge_link", "trim", "align"]);
}

#[test]
fn new_start_reruns_everything() {
    let toy = Toy::new();
    toy.run(toy.chain()).unwrap();

    let forced: Vec<Stage> = toy.chain().into_iter().map(|s| s.force(true)).collect();
    let summary = toy.run(forced).unwrap();
    assert_eq!(summary.executed().len(), 4);
    assert_eq!(toy.journal().len(), 8);
}

#[test]
fn touched_input_reruns_downstream() {
    let toy = Toy::new();
    toy.run(toy.chain()).unwrap();

    // rewrite the second artifact; everything after it is stale
    thread::sleep(Duration::from_millis(20));
    fs::write(toy.path("b.txt"), "edited\n").unwrap();
    let summary = toy.run(toy.chain()).unwrap();
    assert_eq!(summary.skipped(), [StageId::MergeLink, StageId::FastqConversion]);
    assert_eq!(summary.executed(), [StageId::Trim, StageId::Align]);
}

// ============================================================
// Validation gates
// ============================================================

#[test]
fn count_mismatch_is_fatal_and_quarantines_output() {
    let toy = Toy::new();
    let (a, b, c) = (toy.path("a.bam"), toy.path("fastq/a.fastq"), toy.path("c.txt"));
    let gate = ValidationGate::new(
        Counter::command("a.bam", CommandSpec::shell("echo 1000")),
        Counter::command("a.fastq", CommandSpec::shell("echo 900")),
    )
    .report_as("Raw_reads", "Fastq_reads");
    let stages = vec![
        toy.step(StageId::MergeLink, &[&toy.input], &a),
        toy.step(StageId::FastqConversion, &[&a], &b).validate(gate),
        toy.step(StageId::Trim, &[&b], &c),
    ];

    let err = toy.run(stages).unwrap_err();
    match &err {
        PipelineError::Validation {
            stage,
            failure: GateFailure::Mismatch { before, after, .. },
        } => {
            assert_eq!(*stage, StageId::FastqConversion);
            assert_eq!((*before, *after), (1000, 900));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(toy.journal(), ["merge_link", "fastq_conversion"]);
    assert!(!b.exists());
    assert!(toy.path("fastq/a.fastq.invalid").exists());
    assert!(!c.exists());

    let checkpoint = toy.checkpoint();
    assert_eq!(checkpoint.state, RunState::Failed);
    assert!(!checkpoint.is_completed(StageId::FastqConversion));
    assert_eq!(checkpoint.last_completed, Some(StageId::MergeLink));

    let stats = toy.stats();
    assert_eq!(stats.get("Raw_reads"), Some(&MetricValue::Int(1000)));
    assert_eq!(stats.get("Fastq_reads"), Some(&MetricValue::Int(900)));
}

#[test]
fn unmeasurable_gate_is_fatal() {
    let toy = Toy::new();
    let a = toy.path("a.txt");
    let gate = ValidationGate::new(
        Counter::fastq([toy.path("missing.fastq")]),
        Counter::fastq([&a]),
    );
    let err = toy
        .run(vec![toy.step(StageId::FastqConversion, &[&toy.input], &a).validate(gate)])
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Validation {
            failure: GateFailure::Unmeasurable { .. },
            ..
        }
    ));
}

// ============================================================
// Cleanup
// ============================================================

#[test]
fn conditional_cleanup_waits_for_completion() {
    let toy = Toy::new();
    let gate = toy.path("gate");
    let (fq, out) = (toy.path("s1_R1.fastq"), toy.path("b.txt"));
    let pattern = toy.path("*.fastq");
    let stages = || {
        vec![
            toy.step(StageId::FastqConversion, &[&toy.input], &fq)
                .clean(CleanupEntry::conditional(&pattern)),
            toy.guarded(StageId::Trim, Some(&gate), &[&fq], &out),
        ]
    };

    toy.run(stages()).unwrap_err();
    assert!(fq.exists(), "failed run keeps conditional intermediates");

    fs::write(&gate, "").unwrap();
    let summary = toy.run(stages()).unwrap();
    assert_eq!(summary.skipped(), [StageId::FastqConversion]);
    assert_eq!(summary.removed, [fq.clone()]);
    assert!(!fq.exists());

    // intermediate is gone but its consumer is satisfied
    let summary = toy.run(stages()).unwrap();
    assert!(summary.executed().is_empty());
    assert_eq!(toy.journal(), ["fastq_conversion", "trim"]);
}

#[test]
fn unconditional_cleanup_applies_even_when_run_fails() {
    let toy = Toy::new();
    let (sam, bam, out) = (toy.path("s1.aln.sam"), toy.path("s1.aln_sorted.bam"), toy.path("c.txt"));
    let stages = vec![
        toy.step(StageId::Align, &[&toy.input], &sam),
        toy.step(StageId::Sort, &[&sam], &bam)
            .clean(CleanupEntry::unconditional(&sam)),
        Stage::new(StageId::Deduplicate)
            .command(CommandSpec::shell("exit 1"))
            .input(&bam)
            .output(&out),
    ];

    let err = toy.run(stages).unwrap_err();
    assert!(matches!(err, PipelineError::Execution { stage: StageId::Deduplicate, .. }));
    assert!(!sam.exists());
    assert!(bam.exists());
}

// ============================================================
// Locking and interruption
// ============================================================

#[test]
fn held_lock_rejects_second_run() {
    let toy = Toy::new();
    fs::create_dir_all(toy.outdir()).unwrap();
    let _held = RunLock::acquire(toy.outdir(), "s1").unwrap();

    let built = Cell::new(false);
    let err = Runner::new(&AtomicBool::new(false))
        .run_stages(toy.identity.clone(), RunFlags::default(), &[], || {
            built.set(true);
            Ok(toy.chain())
        })
        .unwrap_err();

    match err {
        PipelineError::Lock { holder, .. } => {
            assert!(holder.contains(&std::process::id().to_string()))
        }
        other => panic!("expected lock error, got {other:?}"),
    }
    assert!(!built.get());
    assert!(toy.journal().is_empty());
}

#[test]
fn recover_clears_stale_lock() {
    let toy = Toy::new();
    fs::create_dir_all(toy.outdir()).unwrap();
    fs::write(toy.path(LOCK_FILE), "garbage").unwrap();

    let summary = Runner::new(&AtomicBool::new(false))
        .with_recover(true)
        .with_poll(Duration::from_millis(10))
        .run_stages(toy.identity.clone(), RunFlags::default(), &[], || Ok(toy.chain()))
        .unwrap();
    assert_eq!(summary.state, RunState::Completed);
    assert!(!toy.path(LOCK_FILE).exists());
}

#[test]
fn interrupt_before_first_stage() {
    let toy = Toy::new();
    let cancel = AtomicBool::new(true);

    let err = toy.run_with(&cancel, toy.chain()).unwrap_err();
    assert!(matches!(err, PipelineError::Interrupted { stage: None }));
    assert_eq!(err.exit_code(), EXIT_INTERRUPTED);
    assert!(toy.journal().is_empty());
    assert_eq!(toy.checkpoint().state, RunState::Interrupted);
    assert!(!toy.path(LOCK_FILE).exists());
}

#[test]
fn interrupt_mid_stage_then_resume() {
    let toy = Toy::new();
    let gate = toy.path("gate");
    let (a, b, c) = (toy.path("a.txt"), toy.path("b.txt"), toy.path("c.txt"));
    let slow = Stage::new(StageId::Trim)
        .command(CommandSpec::shell(format!(
            "echo trim >> {journal} && if [ ! -e {gate} ]; then sleep 10; fi && cat {a} > {b}",
            journal = toy.journal.display(),
            gate = gate.display(),
            a = a.display(),
            b = b.display()
        )))
        .input(&a)
        .output(&b);
    let stages = vec![
        toy.step(StageId::MergeLink, &[&toy.input], &a),
        slow,
        toy.step(StageId::Align, &[&b], &c),
    ];

    let cancel = AtomicBool::new(false);
    let started = Instant::now();
    let result = thread::scope(|scope| {
        scope.spawn(|| {
            while !toy.journal().iter().any(|l| l == "trim") {
                if started.elapsed() > Duration::from_secs(5) {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            cancel.store(true, Ordering::Relaxed);
        });
        toy.run_with(&cancel, stages.clone())
    });

    let err = result.unwrap_err();
    assert!(matches!(err, PipelineError::Interrupted { stage: Some(StageId::Trim) }));
    assert!(started.elapsed() < Duration::from_secs(9), "child was not killed");
    assert!(!b.exists());
    let checkpoint = toy.checkpoint();
    assert_eq!(checkpoint.state, RunState::Interrupted);
    assert_eq!(checkpoint.last_completed, Some(StageId::MergeLink));

    fs::write(&gate, "").unwrap();
    let summary = toy.run(stages).unwrap();
    assert_eq!(summary.skipped(), [StageId::MergeLink]);
    assert_eq!(summary.executed(), [StageId::Trim, StageId::Align]);
}

#[test]
fn outputs_of_a_killed_run_are_discarded() {
    let toy = Toy::new();
    toy.run(toy.chain()).unwrap();

    // a run killed while fastq_conversion was writing its output
    let b = toy.path("b.txt");
    fs::write(&b, "partial").unwrap();
    let mut record = CheckpointRecord::open(&toy.identity, RunFlags::default()).unwrap();
    record.begin(StageId::FastqConversion);
    record.set_state(RunState::Running);
    record.save().unwrap();
    fs::remove_file(&toy.journal).unwrap();

    let summary = toy.run(toy.chain()).unwrap();
    assert_eq!(summary.skipped(), [StageId::MergeLink]);
    assert_eq!(toy.journal(), ["fastq_conversion", "trim", "align"]);
    assert_eq!(fs::read_to_string(toy.path("b.txt.invalid")).unwrap(), "partial");
    assert_eq!(fs::read_to_string(&b).unwrap(), "reads\n");
    let checkpoint = toy.checkpoint();
    assert_eq!(checkpoint.in_progress, None);
    assert!(checkpoint.is_completed(StageId::FastqConversion));
}

#[test]
fn interrupt_stops_processes_started_by_the_stage() {
    let toy = Toy::new();
    let a = toy.path("a.txt");
    let kept = toy.path("filt.sam");
    let nested = Stage::new(StageId::Filter)
        .command(CommandSpec::shell(format!(
            "echo filter >> {journal}; sh -c 'sleep 1; echo late > {kept}'; true",
            journal = toy.journal.display(),
            kept = kept.display()
        )))
        .input(&a)
        .output(&kept);
    let stages = vec![toy.step(StageId::MergeLink, &[&toy.input], &a), nested];

    let cancel = AtomicBool::new(false);
    let started = Instant::now();
    let result = thread::scope(|scope| {
        scope.spawn(|| {
            while !toy.journal().iter().any(|l| l == "filter") {
                if started.elapsed() > Duration::from_secs(5) {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            cancel.store(true, Ordering::Relaxed);
        });
        toy.run_with(&cancel, stages)
    });

    let err = result.unwrap_err();
    assert!(matches!(err, PipelineError::Interrupted { stage: Some(StageId::Filter) }));
    assert!(!toy.path(LOCK_FILE).exists());

    thread::sleep(Duration::from_millis(1500));
    assert!(!kept.exists(), "a process outlived the interrupted run");
}

#[test]
fn interrupt_during_validation_leaves_stage_unverified() {
    let toy = Toy::new();
    let gate = toy.path("gate");
    let (a, b) = (toy.path("a.txt"), toy.path("b.txt"));
    let stages = || {
        vec![
            toy.step(StageId::MergeLink, &[&toy.input], &a),
            toy.step(StageId::FastqConversion, &[&a], &b).validate(ValidationGate::new(
                Counter::command(
                    "slow count",
                    CommandSpec::shell(format!("test -e {} || sleep 30; echo 1", gate.display())),
                ),
                Counter::command("count", CommandSpec::shell("echo 1")),
            )),
        ]
    };

    let cancel = AtomicBool::new(false);
    let started = Instant::now();
    let result = thread::scope(|scope| {
        scope.spawn(|| {
            while !toy.journal().iter().any(|l| l == "fastq_conversion") {
                if started.elapsed() > Duration::from_secs(5) {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            thread::sleep(Duration::from_millis(100));
            cancel.store(true, Ordering::Relaxed);
        });
        toy.run_with(&cancel, stages())
    });

    let err = result.unwrap_err();
    assert!(
        matches!(err, PipelineError::Interrupted { stage: Some(StageId::FastqConversion) }),
        "{err}"
    );
    assert!(started.elapsed() < Duration::from_secs(20), "count was not cancelled");
    assert!(!b.exists());
    let checkpoint = toy.checkpoint();
    assert_eq!(checkpoint.state, RunState::Interrupted);
    assert!(!checkpoint.is_completed(StageId::FastqConversion));

    fs::write(&gate, "").unwrap();
    let summary = toy.run(stages()).unwrap();
    assert_eq!(summary.executed(), [StageId::FastqConversion]);
    assert!(b.exists());
}

// ============================================================
// Fail-soft stages and metric probes
// ============================================================

#[test]
fn fail_soft_stage_reports_exit_code_and_continues() {
    let toy = Toy::new();
    let gate = toy.path("gate");
    let (a, soft, c) = (toy.path("a.txt"), toy.path("soft.txt"), toy.path("c.txt"));
    let stages = || {
        vec![
            toy.step(StageId::MergeLink, &[&toy.input], &a),
            Stage::new(StageId::Sort)
                .command(CommandSpec::shell(format!(
                    "test -e {} || exit 3; echo ok > {}",
                    gate.display(),
                    soft.display()
                )))
                .input(&a)
                .output(&soft)
                .fail_soft(true),
            toy.step(StageId::Align, &[&a], &c),
        ]
    };

    let summary = toy.run(stages()).unwrap();
    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.stages[1], (StageId::Sort, StageStatus::SoftFailed));
    assert_eq!(summary.metric("sort_exit_code"), Some(&MetricValue::Int(3)));
    assert!(c.exists());

    // still failing: the carried value is replaced, not reported twice
    let summary = toy.run(stages()).unwrap();
    assert_eq!(summary.stages[1].1, StageStatus::SoftFailed);
    assert_eq!(summary.metric("sort_exit_code"), Some(&MetricValue::Int(3)));

    fs::write(&gate, "").unwrap();
    let summary = toy.run(stages()).unwrap();
    assert_eq!(summary.stages[1].1, StageStatus::Completed);
    assert_eq!(summary.metric("sort_exit_code"), Some(&MetricValue::Int(0)));
}

#[test]
fn consumers_of_soft_failed_output_are_blocked() {
    let toy = Toy::new();
    let gate = toy.path("gate");
    let (a, b, c, d, e) = (
        toy.path("a.txt"),
        toy.path("b.txt"),
        toy.path("c.txt"),
        toy.path("d.txt"),
        toy.path("e.txt"),
    );
    let stages = || {
        vec![
            toy.step(StageId::MergeLink, &[&toy.input], &a),
            Stage::new(StageId::Trim)
                .command(CommandSpec::shell(format!(
                    "test -e {} || exit 3; cat {} > {}",
                    gate.display(),
                    a.display(),
                    b.display()
                )))
                .input(&a)
                .output(&b)
                .fail_soft(true),
            toy.step(StageId::Align, &[&b], &c),
            toy.step(StageId::Sort, &[&c], &d),
            toy.step(StageId::Deduplicate, &[&a], &e),
        ]
    };

    let summary = toy.run(stages()).unwrap();
    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.stages[1].1, StageStatus::SoftFailed);
    assert_eq!(summary.blocked(), [StageId::Align, StageId::Sort]);
    assert_eq!(summary.executed(), [StageId::MergeLink, StageId::Trim, StageId::Deduplicate]);
    assert_eq!(toy.journal(), ["merge_link", "deduplicate"]);
    assert_eq!(summary.metric("trim_exit_code"), Some(&MetricValue::Int(3)));
    assert_eq!(summary.metric("align_exit_code"), Some(&MetricValue::from(BLOCKED)));
    assert_eq!(summary.metric("sort_exit_code"), Some(&MetricValue::from(BLOCKED)));
    assert!(!c.exists() && !d.exists());
    assert!(!toy.checkpoint().is_completed(StageId::Align));

    // once the soft stage succeeds the blocked consumers run and clear their mark
    fs::write(&gate, "").unwrap();
    let summary = toy.run(stages()).unwrap();
    assert!(summary.blocked().is_empty());
    assert_eq!(summary.executed(), [StageId::Trim, StageId::Align, StageId::Sort]);
    assert_eq!(summary.metric("align_exit_code"), Some(&MetricValue::Int(0)));
    assert_eq!(summary.metric("trim_exit_code"), Some(&MetricValue::Int(0)));
    assert!(d.exists());
}

#[test]
fn failing_probe_only_warns() {
    let toy = Toy::new();
    let a = toy.path("a.txt");
    let stages = vec![toy
        .step(StageId::Align, &[&toy.input], &a)
        .metric(MetricProbe::count(
            "Aligned_reads",
            Counter::command("mapped reads", CommandSpec::shell("exit 2")),
        ))
        .metric(MetricProbe::count("Lines", Counter::command("lines", CommandSpec::shell("echo 7"))))];

    let summary = toy.run(stages).unwrap();
    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.metric("Aligned_reads"), None);
    assert_eq!(summary.metric("Lines"), Some(&MetricValue::Int(7)));
    assert_eq!(summary.metric("Genome"), Some(&MetricValue::from("toy")));
}

#[test]
fn build_error_aborts_before_any_stage() {
    let toy = Toy::new();
    let err = Runner::new(&AtomicBool::new(false))
        .run_stages(toy.identity.clone(), RunFlags::default(), &[], || {
            Err(PipelineError::Configuration("no genome".into()))
        })
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
    assert!(CheckpointRecord::load(toy.outdir()).unwrap().is_none());
    assert!(!toy.path(LOCK_FILE).exists());
}
