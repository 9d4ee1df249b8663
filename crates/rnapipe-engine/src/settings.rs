//! Tool locations, reference resources and per-stage overrides

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::stage::StageId;

/// Program paths for external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    pub java: String,
    /// JVM heap passed as `-Xmx`.
    pub java_memory: String,
    pub samtools: String,
    pub bowtie1: String,
    pub bowtie2: String,
    pub python: String,
    pub rscript: String,
    pub kallisto: String,
    pub trimmomatic_jar: PathBuf,
    pub picard_jar: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            java: "java".into(),
            java_memory: "4g".into(),
            samtools: "samtools".into(),
            bowtie1: "bowtie".into(),
            bowtie2: "bowtie2".into(),
            python: "python".into(),
            rscript: "Rscript".into(),
            kallisto: "kallisto".into(),
            trimmomatic_jar: PathBuf::from("trimmomatic.jar"),
            picard_jar: PathBuf::from("picard.jar"),
        }
    }
}

/// Reference data and helper scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// Root holding `<assembly>/<assembly>.fa` and the aligner indexes.
    pub genomes: PathBuf,
    /// Adapter FASTA for Trimmomatic ILLUMINACLIP.
    pub adapters: PathBuf,
    /// Directory with the read filter and BitSeq scripts.
    pub scripts: PathBuf,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            genomes: PathBuf::from("genomes"),
            adapters: PathBuf::from("adapters.fa"),
            scripts: PathBuf::from("scripts"),
        }
    }
}

impl Resources {
    pub fn genome_fasta(&self, assembly: &str) -> PathBuf {
        self.genomes.join(assembly).join(format!("{assembly}.fa"))
    }

    pub fn bowtie1_index(&self, assembly: &str) -> PathBuf {
        self.genomes.join(assembly).join("indexed_bowtie1").join(assembly)
    }

    pub fn bowtie2_index(&self, assembly: &str) -> PathBuf {
        self.genomes.join(assembly).join("indexed_bowtie2").join(assembly)
    }

    pub fn kallisto_index(&self, assembly: &str) -> PathBuf {
        self.genomes
            .join(assembly)
            .join("indexed_kallisto")
            .join(format!("{assembly}.idx"))
    }

    pub fn filter_script(&self) -> PathBuf {
        self.scripts.join("bisulfiteReadFiltering_forRNA.py")
    }

    pub fn bitseq_script(&self) -> PathBuf {
        self.scripts.join("tools").join("bitSeq_parallel.R")
    }
}

/// Expression quantifier closing the primary sub-graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantifier {
    /// Genome alignment, sorting, filtering and deduplication, then BitSeq.
    #[default]
    Bitseq,
    /// kallisto pseudo-alignment straight from the trimmed reads.
    Kallisto,
}

impl Quantifier {
    pub fn name(self) -> &'static str {
        match self {
            Self::Bitseq => "bitseq",
            Self::Kallisto => "kallisto",
        }
    }
}

impl fmt::Display for Quantifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Quantifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitseq" => Ok(Self::Bitseq),
            "kallisto" => Ok(Self::Kallisto),
            other => Err(format!("unknown quantifier {other:?} (expected bitseq or kallisto)")),
        }
    }
}

/// Per-stage behaviour override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverride {
    pub force: Option<bool>,
    pub fail_soft: Option<bool>,
}

pub type StageOverrides = BTreeMap<StageId, StageOverride>;
