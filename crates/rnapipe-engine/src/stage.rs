//! Stage descriptors: identifiers, commands and declared artifacts

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::cleanup::CleanupEntry;
use crate::report::MetricProbe;
use crate::validation::ValidationGate;

/// Pipeline stage identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    MergeLink,
    FastqConversion,
    Trim,
    Align,
    Sort,
    Filter,
    Deduplicate,
    Quantify,
    ErccFastq,
    ErccAlign,
    ErccQuantify,
    KallistoQuantify,
}

impl StageId {
    pub const ALL: [StageId; 12] = [
        Self::MergeLink,
        Self::FastqConversion,
        Self::Trim,
        Self::Align,
        Self::Sort,
        Self::Filter,
        Self::Deduplicate,
        Self::Quantify,
        Self::ErccFastq,
        Self::ErccAlign,
        Self::ErccQuantify,
        Self::KallistoQuantify,
    ];

    /// Stable name used in logs, checkpoint, config and log file names.
    pub fn name(self) -> &'static str {
        match self {
            Self::MergeLink => "merge_link",
            Self::FastqConversion => "fastq_conversion",
            Self::Trim => "trim",
            Self::Align => "align",
            Self::Sort => "sort",
            Self::Filter => "filter",
            Self::Deduplicate => "deduplicate",
            Self::Quantify => "quantify",
            Self::ErccFastq => "ercc_fastq",
            Self::ErccAlign => "ercc_align",
            Self::ErccQuantify => "ercc_quantify",
            Self::KallistoQuantify => "kallisto_quantify",
        }
    }

    /// Parse CLI/config string into enum
    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.name() == s)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One external invocation: either an argument vector or a shell line
/// (needed whenever the template uses redirection or pipes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CommandSpec {
    Exec { program: String, args: Vec<String> },
    Shell(String),
}

impl CommandSpec {
    pub fn exec<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Exec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shell(line: impl Into<String>) -> Self {
        Self::Shell(line.into())
    }

    /// Human-readable form, good enough to paste into a terminal.
    pub fn render(&self) -> String {
        match self {
            Self::Shell(line) => line.clone(),
            Self::Exec { program, args } => {
                let mut out = program.clone();
                for arg in args {
                    out.push(' ');
                    if arg.is_empty() || arg.contains(char::is_whitespace) {
                        out.push_str(&format!("'{arg}'"));
                    } else {
                        out.push_str(arg);
                    }
                }
                out
            }
        }
    }

    pub fn to_command(&self) -> Command {
        match self {
            Self::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            Self::Exec { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A unit of pipeline work.
///
/// `inputs` lists every path the commands read; paths produced by an earlier
/// stage link the two stages, anything else is an external input.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub id: StageId,
    pub commands: Vec<CommandSpec>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<Artifact>,
    pub validation: Option<ValidationGate>,
    pub metrics: Vec<MetricProbe>,
    pub cleanup: Vec<CleanupEntry>,
    /// Always execute, even when outputs are fresh.
    pub force: bool,
    /// Failure is logged and reported, not fatal.
    pub fail_soft: bool,
}

impl Stage {
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            commands: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            validation: None,
            metrics: Vec::new(),
            cleanup: Vec::new(),
            force: false,
            fail_soft: false,
        }
    }

    pub fn command(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    pub fn commands(mut self, commands: impl IntoIterator<Item = CommandSpec>) -> Self {
        self.commands.extend(commands);
        self
    }

    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn inputs<P: Into<PathBuf>>(mut self, paths: impl IntoIterator<Item = P>) -> Self {
        self.inputs.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(Artifact::new(path));
        self
    }

    pub fn outputs<P: Into<PathBuf>>(mut self, paths: impl IntoIterator<Item = P>) -> Self {
        self.outputs.extend(paths.into_iter().map(Artifact::new));
        self
    }

    pub fn validate(mut self, gate: ValidationGate) -> Self {
        self.validation = Some(gate);
        self
    }

    pub fn metric(mut self, probe: MetricProbe) -> Self {
        self.metrics.push(probe);
        self
    }

    pub fn clean(mut self, entry: CleanupEntry) -> Self {
        self.cleanup.push(entry);
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn fail_soft(mut self, fail_soft: bool) -> Self {
        self.fail_soft = fail_soft;
        self
    }

    /// Whether `path` is one of this stage's declared outputs.
    pub fn produces(&self, path: &Path) -> bool {
        self.outputs.iter().any(|a| a.path() == path)
    }

    /// Whether this stage reads `path`.
    pub fn consumes(&self, path: &Path) -> bool {
        self.inputs.iter().any(|p| p == path)
    }

    /// All commands joined for display and fingerprinting.
    pub fn command_line(&self) -> String {
        self.commands
            .iter()
            .map(CommandSpec::render)
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

/// Per-run outcome of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Skipped,
    Completed,
    SoftFailed,
    /// Not executed: an input was never produced because an upstream
    /// fail-soft stage failed.
    Blocked,
    Failed,
}

impl StageStatus {
    /// Completed or skipped: downstream stages may read its artifacts.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Skipped | Self::Completed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Completed => "completed",
            Self::SoftFailed => "failed (soft)",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_name_roundtrip() {
        for id in StageId::ALL {
            assert_eq!(StageId::from_name(id.name()), Some(id));
        }
        assert_eq!(StageId::from_name("bitseq"), None);
    }

    #[test]
    fn stage_name_serde_matches_display() {
        let json = serde_json::to_string(&StageId::ErccFastq).unwrap();
        assert_eq!(json, "\"ercc_fastq\"");
        assert_eq!(StageId::ErccFastq.to_string(), "ercc_fastq");
    }

    #[test]
    fn exec_render_quotes_whitespace() {
        let cmd = CommandSpec::exec("samtools", ["view", "-c", "my file.bam"]);
        assert_eq!(cmd.render(), "samtools view -c 'my file.bam'");
    }

    #[test]
    fn shell_runs_through_sh() {
        let cmd = CommandSpec::shell("echo hi > out.txt");
        let command = cmd.to_command();
        assert_eq!(command.get_program(), "sh");
        assert_eq!(cmd.render(), "echo hi > out.txt");
    }

    #[test]
    fn builder_collects_declarations() {
        let stage = Stage::new(StageId::Sort)
            .command(CommandSpec::shell("a"))
            .command(CommandSpec::shell("b"))
            .input("/o/s.aln.sam")
            .output("/o/s.aln_sorted.bam")
            .fail_soft(true);
        assert_eq!(stage.command_line(), "a && b");
        assert!(stage.consumes(Path::new("/o/s.aln.sam")));
        assert!(stage.produces(Path::new("/o/s.aln_sorted.bam")));
        assert!(stage.fail_soft);
        assert!(!stage.force);
    }
}
