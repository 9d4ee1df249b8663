//! Stage graph builder: run-mode flags → ordered stage list
//!
//! The builder is a pure function of the sample description, the flags and
//! the settings. It never touches the filesystem, so building the same
//! inputs twice yields identical stage lists.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::artifact::InputFormat;
use crate::cleanup::CleanupEntry;
use crate::commands::{sorted_bam, sorted_depth, swap_suffix, Templates, TrimFiles};
use crate::error::{PipelineError, Result};
use crate::report::MetricProbe;
use crate::run::{RunFlags, RunIdentity};
use crate::settings::{Quantifier, Resources, StageOverrides, Toolchain};
use crate::stage::{Stage, StageId};
use crate::validation::{Counter, ValidationGate};

/// One sample to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSpec {
    pub name: String,
    /// Parent directory; the run writes to `<output_parent>/<name>`.
    pub output_parent: PathBuf,
    /// First-mate (or only) inputs. Several files are merged.
    pub read1: Vec<PathBuf>,
    /// Second-mate FASTQ inputs for paired layout. Empty for BAM input.
    pub read2: Vec<PathBuf>,
    /// Primary genome assembly id, e.g. `hg38`.
    pub genome: String,
    /// Spike-in reference assembly id, e.g. `ERCC92`.
    pub ercc: Option<String>,
    pub cores: usize,
}

impl SampleSpec {
    pub fn identity(&self) -> RunIdentity {
        RunIdentity::new(&self.name, &self.output_parent)
    }

    /// Check the sample against the flags and detect the input format.
    fn check(&self, flags: RunFlags) -> Result<InputFormat> {
        let config = |msg: String| Err(PipelineError::Configuration(msg));

        let name = self.name.trim();
        if name.is_empty() {
            return config("sample name is empty".into());
        }
        if name.contains('/') || name != self.name {
            return config(format!("invalid sample name {:?}", self.name));
        }
        if self.genome.trim().is_empty() {
            return config("no genome assembly given".into());
        }
        if self.cores == 0 {
            return config("core count must be at least 1".into());
        }
        if self.read1.is_empty() {
            return config(format!("no input files for sample {}", self.name));
        }

        let mut format = None;
        for path in self.read1.iter().chain(&self.read2) {
            let Some(detected) = InputFormat::detect(path) else {
                return config(format!(
                    "unrecognized input format: {} (expected .bam, .fastq or .fastq.gz)",
                    path.display()
                ));
            };
            match format {
                None => format = Some(detected),
                Some(f) if f != detected => {
                    return config(format!(
                        "mixed input formats: {} is {:?}, earlier inputs are {:?}",
                        path.display(),
                        detected,
                        f
                    ));
                }
                Some(_) => {}
            }
        }
        let Some(format) = format else {
            return config(format!("no input files for sample {}", self.name));
        };

        match (flags.paired, format) {
            (false, _) if !self.read2.is_empty() => {
                return config("second-mate inputs given for a single-end run".into());
            }
            (true, InputFormat::Bam) if !self.read2.is_empty() => {
                return config("paired BAM input carries both mates; drop the second-mate list".into());
            }
            (true, InputFormat::Fastq | InputFormat::FastqGz)
                if self.read2.len() != self.read1.len() =>
            {
                return config(format!(
                    "paired FASTQ input needs one second-mate file per first-mate file ({} vs {})",
                    self.read1.len(),
                    self.read2.len()
                ));
            }
            _ => {}
        }

        if flags.ercc_enabled && self.ercc.as_deref().is_none_or(|e| e.trim().is_empty()) {
            return config("spike-in analysis enabled but no spike-in reference given".into());
        }
        Ok(format)
    }
}

/// Paths derived from the sample output directory.
struct Layout {
    name: String,
    raw: PathBuf,
    fastq: PathBuf,
    bowtie1: PathBuf,
}

impl Layout {
    fn new(outdir: &Path, name: &str, genome: &str) -> Self {
        Self {
            name: name.to_string(),
            raw: outdir.join("raw"),
            fastq: outdir.join("fastq"),
            bowtie1: outdir.join(format!("bowtie1_{genome}")),
        }
    }

    fn fastq_file(&self, suffix: &str) -> PathBuf {
        self.fastq.join(format!("{}_{suffix}.fastq", self.name))
    }

    fn mates(&self, paired: bool, suffix: &str) -> Vec<PathBuf> {
        let mut files = vec![self.fastq_file(&format!("R1{suffix}"))];
        if paired {
            files.push(self.fastq_file(&format!("R2{suffix}")));
        }
        files
    }
}

/// Directory holding an aligner index given by its basename prefix.
fn index_dir(prefix: &Path) -> PathBuf {
    prefix.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn first_and_second(files: &[PathBuf]) -> (&Path, Option<&Path>) {
    (&files[0], files.get(1).map(PathBuf::as_path))
}

/// Builds the stage list for one sample.
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    pub tools: Toolchain,
    pub resources: Resources,
    pub overrides: StageOverrides,
    /// Force every stage to execute.
    pub new_start: bool,
    pub quantifier: Quantifier,
}

impl GraphBuilder {
    pub fn new(tools: Toolchain, resources: Resources) -> Self {
        Self {
            tools,
            resources,
            ..Default::default()
        }
    }

    pub fn with_overrides(mut self, overrides: StageOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_new_start(mut self, new_start: bool) -> Self {
        self.new_start = new_start;
        self
    }

    pub fn with_quantifier(mut self, quantifier: Quantifier) -> Self {
        self.quantifier = quantifier;
        self
    }

    /// Check that the reference data the stage list will read exists: the
    /// genome FASTA and bowtie1 index directory (or the kallisto index),
    /// plus the spike-in FASTA and bowtie2 index directory when spike-in
    /// analysis is enabled.
    ///
    /// Separate from [`build`](Self::build), which never touches the
    /// filesystem.
    pub fn check_references(&self, sample: &SampleSpec, flags: RunFlags) -> Result<()> {
        let genome = sample.genome.as_str();
        let mut required = match self.quantifier {
            Quantifier::Bitseq => vec![
                (self.resources.genome_fasta(genome), false),
                (index_dir(&self.resources.bowtie1_index(genome)), true),
            ],
            Quantifier::Kallisto => vec![(self.resources.kallisto_index(genome), false)],
        };
        if flags.ercc_enabled {
            if let Some(ercc) = sample.ercc.as_deref().filter(|e| !e.trim().is_empty()) {
                required.push((self.resources.genome_fasta(ercc), false));
                required.push((index_dir(&self.resources.bowtie2_index(ercc)), true));
            }
        }

        let missing: Vec<String> = required
            .iter()
            .filter(|(path, dir)| if *dir { !path.is_dir() } else { !path.is_file() })
            .map(|(path, _)| path.display().to_string())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(PipelineError::Configuration(format!(
            "missing reference data: {}",
            missing.join(", ")
        )))
    }

    /// Construct and validate the ordered stage list.
    ///
    /// The kallisto quantifier replaces everything after `trim` with one
    /// fail-soft `kallisto_quantify` stage; `filter_enabled` has no effect
    /// there and spike-in analysis is rejected.
    pub fn build(&self, sample: &SampleSpec, flags: RunFlags) -> Result<Vec<Stage>> {
        let format = sample.check(flags)?;
        if self.quantifier == Quantifier::Kallisto && flags.ercc_enabled {
            return Err(PipelineError::Configuration(
                "spike-in analysis needs the bitseq quantifier".into(),
            ));
        }
        let t = Templates::new(&self.tools, &self.resources, sample.cores);
        let outdir = sample.identity().outdir;
        let name = sample.name.as_str();
        let genome = sample.genome.as_str();
        let paired = flags.paired;
        let layout = Layout::new(&outdir, name, genome);
        let mut stages = Vec::new();

        // merge_link
        let raw: Vec<PathBuf> = match format {
            InputFormat::Bam => vec![layout.raw.join(format!("{name}.bam"))],
            _ => {
                let ext = format.extension();
                let mut raw = vec![layout.raw.join(format!("{name}_R1.{ext}"))];
                if paired {
                    raw.push(layout.raw.join(format!("{name}_R2.{ext}")));
                }
                raw
            }
        };
        let groups = [&sample.read1, &sample.read2];
        let merge_link = raw.iter().zip(groups).map(|(dst, inputs)| {
            if let [single] = inputs.as_slice() {
                t.link(single, dst)
            } else if format == InputFormat::Bam {
                t.merge_bam(inputs, dst)
            } else {
                t.concat(inputs, dst)
            }
        });
        stages.push(
            Stage::new(StageId::MergeLink)
                .commands(merge_link.collect::<Vec<_>>())
                .inputs(sample.read1.iter().chain(&sample.read2))
                .outputs(raw.iter()),
        );

        // fastq_conversion
        let fastq = layout.mates(paired, "");
        let (fq1, fq2) = first_and_second(&fastq);
        let conversion = match format {
            InputFormat::Bam => vec![t.bam_to_fastq(&raw[0], fq1, fq2)],
            InputFormat::FastqGz => raw.iter().zip(&fastq).map(|(r, f)| t.gunzip(r, f)).collect(),
            InputFormat::Fastq => raw.iter().zip(&fastq).map(|(r, f)| t.link(r, f)).collect(),
        };
        let raw_counter = match format {
            InputFormat::Bam => {
                Counter::command(raw[0].display().to_string(), t.count_records(&raw[0]))
            }
            _ => Counter::fastq(raw.iter()),
        };
        stages.push(
            Stage::new(StageId::FastqConversion)
                .commands(conversion)
                .inputs(raw.iter())
                .outputs(fastq.iter())
                .validate(
                    ValidationGate::new(raw_counter, Counter::fastq(fastq.iter()))
                        .report_as("Raw_reads", "Fastq_reads"),
                )
                .metric(MetricProbe::file_size_mb("File_mb", raw.iter()))
                .clean(CleanupEntry::conditional(format!(
                    "{}/{}*.fastq",
                    glob::Pattern::escape(&layout.fastq.to_string_lossy()),
                    glob::Pattern::escape(name)
                ))),
        );

        // trim
        let trimmed = layout.mates(paired, "_trimmed");
        let trimlog = layout.fastq.join("trimlog.log");
        let trim = if paired {
            let r1_unpaired = layout.fastq_file("R1_unpaired");
            let r2_unpaired = layout.fastq_file("R2_unpaired");
            t.trimmomatic(
                TrimFiles::Paired {
                    input: [&fastq[0], &fastq[1]],
                    output: [&trimmed[0], &r1_unpaired, &trimmed[1], &r2_unpaired],
                },
                &trimlog,
                flags.coreseq_mode,
            )
        } else {
            t.trimmomatic(
                TrimFiles::Single {
                    input: &fastq[0],
                    output: &trimmed[0],
                },
                &trimlog,
                flags.coreseq_mode,
            )
        };
        stages.push(
            Stage::new(StageId::Trim)
                .command(trim)
                .inputs(fastq.iter())
                .inputs([&self.resources.adapters])
                .outputs(trimmed.iter())
                .metric(MetricProbe::count("Trimmed_reads", Counter::fastq([&trimmed[0]])))
                .fail_soft(self.quantifier == Quantifier::Kallisto),
        );

        match self.quantifier {
            Quantifier::Bitseq => {
                self.push_alignment(&mut stages, &t, &layout, &outdir, sample, flags, &trimmed);
            }
            Quantifier::Kallisto => {
                let (tr1, tr2) = first_and_second(&trimmed);
                let quant_dir = outdir.join(format!("kallisto_{genome}"));
                let index = self.resources.kallisto_index(genome);
                stages.push(
                    Stage::new(StageId::KallistoQuantify)
                        .command(t.kallisto_quant(&index, &quant_dir, tr1, tr2))
                        .command(t.kallisto_h5dump(&quant_dir))
                        .inputs(trimmed.iter())
                        .input(&index)
                        .output(quant_dir.join("abundance.tsv"))
                        .fail_soft(true),
                );
            }
        }

        for stage in &mut stages {
            let over = self.overrides.get(&stage.id).copied().unwrap_or_default();
            stage.force = self.new_start || over.force.unwrap_or(stage.force);
            stage.fail_soft = over.fail_soft.unwrap_or(stage.fail_soft);
        }

        validate(&stages)?;
        Ok(stages)
    }

    /// Genome alignment through BitSeq quantification, plus the spike-in
    /// sub-graph when enabled.
    #[allow(clippy::too_many_arguments)]
    fn push_alignment(
        &self,
        stages: &mut Vec<Stage>,
        t: &Templates<'_>,
        layout: &Layout,
        outdir: &Path,
        sample: &SampleSpec,
        flags: RunFlags,
        trimmed: &[PathBuf],
    ) {
        let name = layout.name.as_str();
        let genome = sample.genome.as_str();
        let paired = flags.paired;

        // align
        let aln_sam = layout.bowtie1.join(format!("{name}.aln.sam"));
        let (tr1, tr2) = first_and_second(trimmed);
        stages.push(
            Stage::new(StageId::Align)
                .command(t.bowtie1(&self.resources.bowtie1_index(genome), tr1, tr2, &aln_sam))
                .inputs(trimmed.iter())
                .output(&aln_sam)
                .metric(MetricProbe::count(
                    "Aligned_reads",
                    Counter::command("mapped reads", t.count_mapped(&aln_sam)),
                )),
        );

        // sort (depth only when the raw stream is the final one)
        let mut sort = Stage::new(StageId::Sort)
            .commands(t.sam_conversions(&aln_sam, !flags.filter_enabled))
            .input(&aln_sam)
            .output(sorted_bam(&aln_sam))
            .clean(CleanupEntry::unconditional(&aln_sam))
            .clean(CleanupEntry::unconditional(swap_suffix(&aln_sam, ".sam", ".bam")));
        if !flags.filter_enabled {
            sort = sort.output(sorted_depth(&aln_sam));
        }
        stages.push(sort);

        // filter: kept and skipped streams each converted and sorted
        let quant_sam = if flags.filter_enabled {
            let kept = layout.bowtie1.join(format!("{name}.aln.filt.sam"));
            let skipped = layout.bowtie1.join(format!("{name}.aln.skipped.sam"));
            let mut commands = vec![t.read_filter(&aln_sam, &kept, &skipped, genome, paired)];
            commands.extend(t.sam_conversions(&kept, true));
            commands.extend(t.sam_conversions(&skipped, false));
            stages.push(
                Stage::new(StageId::Filter)
                    .commands(commands)
                    .input(&aln_sam)
                    .outputs([
                        kept.clone(),
                        skipped.clone(),
                        sorted_bam(&kept),
                        sorted_depth(&kept),
                        sorted_bam(&skipped),
                    ])
                    .metric(MetricProbe::count(
                        "Filtered_reads",
                        Counter::command("kept reads", t.count_mapped(&kept)),
                    ))
                    .clean(CleanupEntry::unconditional(&skipped))
                    .clean(CleanupEntry::unconditional(swap_suffix(&skipped, ".sam", ".bam")))
                    .clean(CleanupEntry::unconditional(&kept))
                    .clean(CleanupEntry::unconditional(swap_suffix(&kept, ".sam", ".bam"))),
            );
            kept
        } else {
            aln_sam.clone()
        };

        // deduplicate
        let dedup_in = sorted_bam(&quant_sam);
        let dedup_out = swap_suffix(&quant_sam, ".sam", "_dedup.bam");
        let dedup_metrics = swap_suffix(&quant_sam, ".sam", "_dedup.metrics");
        stages.push(
            Stage::new(StageId::Deduplicate)
                .command(t.mark_duplicates(&dedup_in, &dedup_out, &dedup_metrics))
                .input(&dedup_in)
                .output(&dedup_out)
                .metric(MetricProbe::count(
                    "Deduplicated_reads",
                    Counter::command("deduplicated reads", t.count_mapped(&dedup_out)),
                )),
        );

        // quantify
        let bitseq_dir = layout.bowtie1.join("bitSeq");
        let genome_fasta = self.resources.genome_fasta(genome);
        stages.push(
            Stage::new(StageId::Quantify)
                .command(t.bitseq(&quant_sam, &bitseq_dir, &genome_fasta))
                .inputs([&quant_sam, &genome_fasta])
                .output(bitseq_dir.join(format!("{name}.counts"))),
        );

        if flags.ercc_enabled {
            let ercc = sample.ercc.as_deref().unwrap_or_default();
            self.push_spike_in(stages, t, layout, outdir, &aln_sam, ercc, paired);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_spike_in(
        &self,
        stages: &mut Vec<Stage>,
        t: &Templates<'_>,
        layout: &Layout,
        outdir: &Path,
        aln_sam: &Path,
        ercc: &str,
        paired: bool,
    ) {
        let name = &layout.name;
        let unmappable = layout.bowtie1.join(format!("{name}.aln_unmappable"));
        let unmappable_bam = swap_suffix(&unmappable, "", ".bam");
        let mut reads = vec![swap_suffix(&unmappable, "", "_R1.fastq")];
        if paired {
            reads.push(swap_suffix(&unmappable, "", "_R2.fastq"));
        }
        let (r1, r2) = first_and_second(&reads);

        // ercc_fastq: unmapped-read extraction + FASTQ conversion
        stages.push(
            Stage::new(StageId::ErccFastq)
                .command(t.unmapped(aln_sam, &unmappable_bam, paired))
                .command(t.bam_to_fastq(&unmappable_bam, r1, r2))
                .input(aln_sam)
                .output(&unmappable_bam)
                .outputs(reads.iter())
                .validate(
                    ValidationGate::new(
                        Counter::command(
                            unmappable_bam.display().to_string(),
                            t.count_records(&unmappable_bam),
                        ),
                        Counter::fastq(reads.iter()),
                    )
                    .report_as("ERCC_raw_reads", "ERCC_fastq_reads"),
                ),
        );

        // ercc_align: secondary reference alignment + sort/depth
        let bowtie2_dir = outdir.join(format!("bowtie2_{ercc}"));
        let ercc_sam = bowtie2_dir.join(format!("{name}_ERCC.aln.sam"));
        let mut commands = vec![t.bowtie2(&self.resources.bowtie2_index(ercc), r1, r2, &ercc_sam)];
        commands.extend(t.sam_conversions(&ercc_sam, true));
        stages.push(
            Stage::new(StageId::ErccAlign)
                .commands(commands)
                .inputs(reads.iter())
                .outputs([ercc_sam.clone(), sorted_bam(&ercc_sam), sorted_depth(&ercc_sam)])
                .metric(MetricProbe::count(
                    "ERCC_aligned_reads",
                    Counter::command("spike-in mapped reads", t.count_mapped(&ercc_sam)),
                ))
                .clean(CleanupEntry::unconditional(&ercc_sam))
                .clean(CleanupEntry::unconditional(swap_suffix(&ercc_sam, ".sam", ".bam")))
                .clean(CleanupEntry::unconditional(format!(
                    "{}*.fastq",
                    glob::Pattern::escape(&unmappable.to_string_lossy())
                ))),
        );

        // ercc_quantify
        let bitseq_dir = bowtie2_dir.join("bitSeq");
        let ercc_fasta = self.resources.genome_fasta(ercc);
        stages.push(
            Stage::new(StageId::ErccQuantify)
                .command(t.bitseq(&ercc_sam, &bitseq_dir, &ercc_fasta))
                .inputs([&ercc_sam, &ercc_fasta])
                .output(bitseq_dir.join(format!("{name}_ERCC.counts")))
                .fail_soft(true),
        );
    }
}

/// Structural checks over a stage list: unique ids, one producer per
/// artifact, producers before consumers, one declaring stage per metric key.
pub fn validate(stages: &[Stage]) -> Result<()> {
    let config = |msg: String| Err(PipelineError::Configuration(msg));
    if stages.is_empty() {
        return config("stage graph is empty".into());
    }

    let mut ids = BTreeSet::new();
    let mut producer: BTreeMap<&Path, usize> = BTreeMap::new();
    let mut metric_owner: BTreeMap<&str, StageId> = BTreeMap::new();

    for (idx, stage) in stages.iter().enumerate() {
        if !ids.insert(stage.id) {
            return config(format!("stage {} appears twice", stage.id));
        }
        for artifact in &stage.outputs {
            if let Some(&other) = producer.get(artifact.path()) {
                return config(format!(
                    "{} is produced by both {} and {}",
                    artifact.path().display(),
                    stages[other].id,
                    stage.id
                ));
            }
            producer.insert(artifact.path(), idx);
        }

        let gate_keys = stage
            .validation
            .iter()
            .flat_map(|g| [g.before_key.as_deref(), g.after_key.as_deref()])
            .flatten();
        let probe_keys = stage.metrics.iter().map(|p| p.key.as_str());
        for key in gate_keys.chain(probe_keys) {
            if let Some(owner) = metric_owner.insert(key, stage.id) {
                return config(format!(
                    "metric {key:?} is reported by both {owner} and {}",
                    stage.id
                ));
            }
        }
    }

    for (idx, stage) in stages.iter().enumerate() {
        for input in &stage.inputs {
            let later = stages
                .iter()
                .enumerate()
                .skip(idx)
                .find(|(_, s)| s.produces(input));
            if let Some((_, p)) = later {
                return config(format!(
                    "stage {} reads {} before {} produces it",
                    stage.id,
                    input.display(),
                    p.id
                ));
            }
        }
    }
    Ok(())
}
