//! Command templates for the external genomics tools
//!
//! Each function renders one invocation. Anything needing redirection or a
//! pipe is a shell line with quoted paths, the rest are argument vectors.

use std::path::{Path, PathBuf};

use crate::settings::{Resources, Toolchain};
use crate::stage::CommandSpec;

/// Quote a path for a POSIX shell line when it contains anything unusual.
pub fn quote(path: &Path) -> String {
    let s = path.to_string_lossy();
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@%,".contains(c));
    if plain {
        s.into_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Trimmomatic file arguments for either read layout.
pub enum TrimFiles<'a> {
    Single {
        input: &'a Path,
        output: &'a Path,
    },
    Paired {
        input: [&'a Path; 2],
        /// `[R1 paired, R1 unpaired, R2 paired, R2 unpaired]`
        output: [&'a Path; 4],
    },
}

/// Renders tool invocations with the configured programs and resources.
#[derive(Debug, Clone, Copy)]
pub struct Templates<'a> {
    pub tools: &'a Toolchain,
    pub resources: &'a Resources,
    pub cores: usize,
}

impl<'a> Templates<'a> {
    pub fn new(tools: &'a Toolchain, resources: &'a Resources, cores: usize) -> Self {
        Self {
            tools,
            resources,
            cores,
        }
    }

    pub fn link(&self, src: &Path, dst: &Path) -> CommandSpec {
        CommandSpec::exec("ln", ["-sf".to_string(), arg(src), arg(dst)])
    }

    pub fn merge_bam(&self, inputs: &[PathBuf], dst: &Path) -> CommandSpec {
        let mut args = vec!["merge".to_string(), "-f".into(), arg(dst)];
        args.extend(inputs.iter().map(|p| arg(p)));
        CommandSpec::exec(&self.tools.samtools, args)
    }

    /// Plain concatenation; valid for FASTQ and for multi-member gzip.
    pub fn concat(&self, inputs: &[PathBuf], dst: &Path) -> CommandSpec {
        let srcs: Vec<String> = inputs.iter().map(|p| quote(p)).collect();
        CommandSpec::shell(format!("cat {} > {}", srcs.join(" "), quote(dst)))
    }

    pub fn gunzip(&self, src: &Path, dst: &Path) -> CommandSpec {
        CommandSpec::shell(format!("gunzip -c {} > {}", quote(src), quote(dst)))
    }

    pub fn bam_to_fastq(&self, bam: &Path, r1: &Path, r2: Option<&Path>) -> CommandSpec {
        match r2 {
            None => CommandSpec::shell(format!(
                "{} fastq {} > {}",
                self.tools.samtools,
                quote(bam),
                quote(r1)
            )),
            Some(r2) => CommandSpec::exec(
                &self.tools.samtools,
                [
                    "fastq".to_string(),
                    "-n".into(),
                    "-1".into(),
                    arg(r1),
                    "-2".into(),
                    arg(r2),
                    "-0".into(),
                    "/dev/null".into(),
                    "-s".into(),
                    "/dev/null".into(),
                    arg(bam),
                ],
            ),
        }
    }

    /// Trimmomatic; `coreseq` crops the first 6 bases and uses the CORE-seq
    /// adapter clip settings.
    pub fn trimmomatic(&self, files: TrimFiles<'_>, trimlog: &Path, coreseq: bool) -> CommandSpec {
        let mut args = vec![
            format!("-Xmx{}", self.tools.java_memory),
            "-jar".into(),
            arg(&self.tools.trimmomatic_jar),
        ];
        let mode = match files {
            TrimFiles::Single { .. } => "SE",
            TrimFiles::Paired { .. } => "PE",
        };
        args.extend([
            mode.to_string(),
            "-phred33".into(),
            "-threads".into(),
            self.cores.to_string(),
            "-trimlog".into(),
            arg(trimlog),
        ]);
        match files {
            TrimFiles::Single { input, output } => args.extend([arg(input), arg(output)]),
            TrimFiles::Paired { input, output } => {
                args.extend(input.iter().map(|p| arg(p)));
                args.extend(output.iter().map(|p| arg(p)));
            }
        }
        let adapters = arg(&self.resources.adapters);
        if coreseq {
            args.extend([
                "HEADCROP:6".to_string(),
                format!("ILLUMINACLIP:{adapters}:2:10:4:1:true:epignome:5"),
                "SLIDINGWINDOW:4:1".into(),
                "MAXINFO:16:0.40".into(),
                "MINLEN:25".into(),
            ]);
        } else {
            args.extend([
                format!("ILLUMINACLIP:{adapters}:2:10:4:1:true"),
                "SLIDINGWINDOW:4:1".into(),
                "MAXINFO:16:0.40".into(),
                "MINLEN:21".into(),
            ]);
        }
        CommandSpec::exec(&self.tools.java, args)
    }

    /// Bowtie1 multi-mapping alignment to SAM.
    pub fn bowtie1(&self, index: &Path, r1: &Path, r2: Option<&Path>, sam: &Path) -> CommandSpec {
        let mut args = vec![
            "-q".to_string(),
            "-p".into(),
            self.cores.to_string(),
            "-a".into(),
            "-m".into(),
            "100".into(),
        ];
        match r2 {
            None => args.extend(["--sam".to_string(), arg(index), arg(r1)]),
            Some(r2) => args.extend([
                "--minins".to_string(),
                "0".into(),
                "--maxins".into(),
                "5000".into(),
                "--fr".into(),
                "--sam".into(),
                "--chunkmbs".into(),
                "200".into(),
                arg(index),
                "-1".into(),
                arg(r1),
                "-2".into(),
                arg(r2),
            ]),
        }
        args.push(arg(sam));
        CommandSpec::exec(&self.tools.bowtie1, args)
    }

    /// Bowtie2 alignment reporting up to 100 hits per read.
    pub fn bowtie2(&self, index: &Path, r1: &Path, r2: Option<&Path>, sam: &Path) -> CommandSpec {
        let mut args = vec![
            "-q".to_string(),
            "-p".into(),
            self.cores.to_string(),
            "-k".into(),
            "100".into(),
        ];
        match r2 {
            None => args.extend(["-x".to_string(), arg(index), "-U".into(), arg(r1)]),
            Some(r2) => args.extend([
                "--minins".to_string(),
                "0".into(),
                "--maxins".into(),
                "5000".into(),
                "-x".into(),
                arg(index),
                "-1".into(),
                arg(r1),
                "-2".into(),
                arg(r2),
            ]),
        }
        args.extend(["-S".to_string(), arg(sam)]);
        CommandSpec::exec(&self.tools.bowtie2, args)
    }

    /// SAM → BAM → sorted BAM → index, plus per-base depth when requested.
    pub fn sam_conversions(&self, sam: &Path, depth: bool) -> Vec<CommandSpec> {
        let samtools = &self.tools.samtools;
        let bam = swap_suffix(sam, ".sam", ".bam");
        let sorted = sorted_bam(sam);
        let mut commands = vec![
            CommandSpec::shell(format!("{samtools} view -bS {} > {}", quote(sam), quote(&bam))),
            CommandSpec::exec(
                samtools,
                [
                    "sort".to_string(),
                    "-@".into(),
                    self.cores.to_string(),
                    "-o".into(),
                    arg(&sorted),
                    arg(&bam),
                ],
            ),
            CommandSpec::exec(samtools, ["index".to_string(), arg(&sorted)]),
        ];
        if depth {
            commands.push(CommandSpec::shell(format!(
                "{samtools} depth {} > {}",
                quote(&sorted),
                quote(&sorted_depth(sam))
            )));
        }
        commands
    }

    /// Bisulfite read filter splitting an alignment into kept and skipped reads.
    pub fn read_filter(
        &self,
        sam: &Path,
        kept: &Path,
        skipped: &Path,
        genome: &str,
        paired: bool,
    ) -> CommandSpec {
        let mut line = format!(
            "{} {} --infile={} --outfile={} --skipped={} \
             --skipHeaderLines=$({} view -SH {} | wc -l) \
             --genome={} --genomeDir={} \
             --minNonCpgSites=3 --minConversionRate=0.9 --maxConversionRate=0.1 -r",
            self.tools.python,
            quote(&self.resources.filter_script()),
            quote(sam),
            quote(kept),
            quote(skipped),
            self.tools.samtools,
            quote(sam),
            genome,
            quote(&self.resources.genomes),
        );
        if paired {
            line.push_str(" --pairedEnd");
        }
        CommandSpec::shell(line)
    }

    pub fn mark_duplicates(&self, input: &Path, output: &Path, metrics: &Path) -> CommandSpec {
        CommandSpec::exec(
            &self.tools.java,
            [
                format!("-Xmx{}", self.tools.java_memory),
                "-jar".into(),
                arg(&self.tools.picard_jar),
                "MarkDuplicates".into(),
                format!("INPUT={}", input.display()),
                format!("OUTPUT={}", output.display()),
                format!("METRICS_FILE={}", metrics.display()),
                "REMOVE_DUPLICATES=true".into(),
                "VALIDATION_STRINGENCY=LENIENT".into(),
            ],
        )
    }

    pub fn bitseq(&self, sam: &Path, outdir: &Path, fasta: &Path) -> CommandSpec {
        CommandSpec::exec(
            &self.tools.rscript,
            [
                arg(&self.resources.bitseq_script()),
                arg(sam),
                arg(outdir),
                arg(fasta),
            ],
        )
    }

    /// kallisto pseudo-alignment: no bootstraps, 50 bp mean fragment length
    /// with a 20 bp deviation (needed for single-end reads).
    pub fn kallisto_quant(&self, index: &Path, outdir: &Path, r1: &Path, r2: Option<&Path>) -> CommandSpec {
        let mut args: Vec<String> = ["quant", "-b", "0", "-l", "50", "-s", "20"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend([
            "-i".into(),
            arg(index),
            "-o".into(),
            arg(outdir),
            "-t".into(),
            self.cores.to_string(),
        ]);
        match r2 {
            Some(r2) => args.extend([arg(r1), arg(r2)]),
            None => args.extend(["--single".into(), arg(r1)]),
        }
        CommandSpec::exec(&self.tools.kallisto, args)
    }

    /// Export the HDF5 abundances written by `kallisto quant` as text.
    pub fn kallisto_h5dump(&self, outdir: &Path) -> CommandSpec {
        CommandSpec::exec(
            &self.tools.kallisto,
            ["h5dump".into(), "-o".into(), arg(outdir), arg(&outdir.join("abundance.h5"))],
        )
    }

    /// Extract reads that did not map to the primary genome. Paired data
    /// keeps only pairs with both mates unmapped so no singleton is lost in
    /// the FASTQ conversion.
    pub fn unmapped(&self, sam: &Path, bam: &Path, paired: bool) -> CommandSpec {
        let flags = if paired { 12 } else { 4 };
        CommandSpec::shell(format!(
            "{} view -hbS -f {flags} {} > {}",
            self.tools.samtools,
            quote(sam),
            quote(bam)
        ))
    }

    /// Total alignment records in a SAM/BAM file.
    pub fn count_records(&self, path: &Path) -> CommandSpec {
        CommandSpec::exec(&self.tools.samtools, ["view".to_string(), "-c".into(), arg(path)])
    }

    /// Distinct read names with at least one mapped alignment.
    pub fn count_mapped(&self, path: &Path) -> CommandSpec {
        CommandSpec::shell(format!(
            "{} view -F 4 {} | cut -f1 | sort -u | wc -l",
            self.tools.samtools,
            quote(path)
        ))
    }
}

/// Replace a trailing `from` with `to` in the file name.
pub fn swap_suffix(path: &Path, from: &str, to: &str) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_suffix(from) {
        Some(stem) => PathBuf::from(format!("{stem}{to}")),
        None => PathBuf::from(format!("{s}{to}")),
    }
}

/// `x.sam` → `x_sorted.bam`
pub fn sorted_bam(sam: &Path) -> PathBuf {
    swap_suffix(sam, ".sam", "_sorted.bam")
}

/// `x.sam` → `x_sorted.depth`
pub fn sorted_depth(sam: &Path) -> PathBuf {
    swap_suffix(sam, ".sam", "_sorted.depth")
}
