pub mod plan;
pub mod run;
pub mod status;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use rnapipe_core::fmt_num;
use rnapipe_engine::{MetricValue, Quantifier, RunFlags, SampleSpec};

use crate::config::Config;

/// Sample description shared by `run` and `plan`.
#[derive(Args, Debug, Clone)]
pub struct SampleArgs {
    /// Sample name; results go to <output-parent>/<sample>
    #[arg(short = 'S', long)]
    pub sample: String,

    /// Input reads (unaligned BAM, FASTQ or FASTQ.gz); several files are merged
    #[arg(short, long = "input", num_args = 1..)]
    pub input: Vec<PathBuf>,

    /// Second-mate FASTQ files, one per --input file
    #[arg(long = "input2", num_args = 1..)]
    pub input2: Vec<PathBuf>,

    /// Paired-end read layout
    #[arg(long)]
    pub paired: bool,

    /// Genome assembly (directory name under the genomes root)
    #[arg(short, long)]
    pub genome: String,

    /// Spike-in reference assembly
    #[arg(short, long, default_value = "ERCC92")]
    pub ercc: String,

    /// Align unmapped reads to the spike-in reference and quantify them
    #[arg(long)]
    pub ercc_mix: bool,

    /// Skip the bisulfite read filter
    #[arg(long)]
    pub no_filter: bool,

    /// CORE-seq trimming mode
    #[arg(long)]
    pub coreseq: bool,

    /// Expression quantifier: bitseq or kallisto (default: [run].quantifier)
    #[arg(long)]
    pub quantifier: Option<Quantifier>,

    /// Parent output directory (default: [run].output_parent)
    #[arg(short, long)]
    pub output_parent: Option<PathBuf>,

    /// Threads passed to the external tools (default: [run].cores)
    #[arg(short = 'p', long)]
    pub cores: Option<usize>,
}

impl SampleArgs {
    pub fn flags(&self) -> RunFlags {
        RunFlags {
            paired: self.paired,
            filter_enabled: !self.no_filter,
            ercc_enabled: self.ercc_mix,
            coreseq_mode: self.coreseq,
        }
    }

    /// Resolve against the configuration. Input paths are made absolute so
    /// the links written into the output directory stay valid.
    pub fn spec(&self, config: &Config) -> Result<SampleSpec> {
        let absolute = |paths: &[PathBuf]| -> Result<Vec<PathBuf>> {
            paths
                .iter()
                .map(|p| {
                    std::fs::canonicalize(p)
                        .with_context(|| format!("input {} not found", p.display()))
                })
                .collect()
        };
        Ok(SampleSpec {
            name: self.sample.clone(),
            output_parent: self
                .output_parent
                .clone()
                .unwrap_or_else(|| config.run.output_parent.clone()),
            read1: absolute(&self.input)?,
            read2: absolute(&self.input2)?,
            genome: self.genome.clone(),
            ercc: Some(self.ercc.clone()).filter(|e| !e.is_empty()),
            cores: self.cores.unwrap_or(config.run.cores),
        })
    }
}

/// Read counts with thousand separators, everything else as recorded.
pub fn display_metric(value: &MetricValue) -> String {
    match value {
        MetricValue::Int(n) => fmt_num(*n),
        other => other.to_string(),
    }
}
