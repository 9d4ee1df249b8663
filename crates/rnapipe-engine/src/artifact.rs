//! Artifacts and the freshness check that drives stage skipping

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

/// A named output location produced by exactly one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    path: PathBuf,
}

/// Result of checking an artifact against the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Exists, non-empty and not older than any existing input.
    Fresh,
    Missing,
    Empty,
    /// An input was modified after the artifact was written.
    Stale { newer_input: PathBuf },
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check existence, size and modification time relative to `inputs`.
    ///
    /// Symlinks are followed, so a linked raw input carries the mtime of its
    /// target. Inputs that no longer exist (cleaned intermediates) are ignored.
    pub fn freshness(&self, inputs: &[PathBuf]) -> Freshness {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return Freshness::Missing,
        };
        if meta.len() == 0 {
            return Freshness::Empty;
        }
        let Ok(written) = meta.modified() else {
            return Freshness::Fresh;
        };
        for input in inputs {
            if let Some(input_time) = modified(input) {
                if input_time > written {
                    return Freshness::Stale {
                        newer_input: input.clone(),
                    };
                }
            }
        }
        Freshness::Fresh
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Read-layout file format of a raw input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Bam,
    Fastq,
    FastqGz,
}

impl InputFormat {
    /// Detect format from the file name.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".bam") {
            Some(Self::Bam)
        } else if name.ends_with(".fastq.gz") || name.ends_with(".fq.gz") {
            Some(Self::FastqGz)
        } else if name.ends_with(".fastq") || name.ends_with(".fq") {
            Some(Self::Fastq)
        } else {
            None
        }
    }

    /// Extension used for the merged/linked copy under `raw/`.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Bam => "bam",
            Self::Fastq => "fastq",
            Self::FastqGz => "fastq.gz",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(path: &Path, content: &[u8], mtime: SystemTime) {
        fs::write(path, content).unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact::new(dir.path().join("out.sam"));
        assert_eq!(artifact.freshness(&[]), Freshness::Missing);

        fs::write(artifact.path(), b"").unwrap();
        assert_eq!(artifact.freshness(&[]), Freshness::Empty);
    }

    #[test]
    fn newer_input_makes_artifact_stale() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let input = dir.path().join("in.fastq");
        let output = dir.path().join("out.sam");
        touch(&output, b"@HD", now - Duration::from_secs(60));
        touch(&input, b"@r1", now);

        let artifact = Artifact::new(&output);
        assert_eq!(
            artifact.freshness(&[input.clone()]),
            Freshness::Stale { newer_input: input }
        );
    }

    #[test]
    fn older_or_missing_inputs_keep_artifact_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let input = dir.path().join("in.fastq");
        let output = dir.path().join("out.sam");
        touch(&input, b"@r1", now - Duration::from_secs(60));
        touch(&output, b"@HD", now);

        let artifact = Artifact::new(&output);
        let cleaned = dir.path().join("deleted.bam");
        assert!(artifact.freshness(&[input, cleaned]).is_fresh());
    }

    #[test]
    fn symlink_takes_target_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("reads.bam");
        fs::write(&input, b"BAM").unwrap();
        let link = dir.path().join("raw.bam");
        std::os::unix::fs::symlink(&input, &link).unwrap();

        assert!(Artifact::new(&link).freshness(&[input]).is_fresh());
    }

    #[test]
    fn detect_formats() {
        assert_eq!(InputFormat::detect(Path::new("a/s1.bam")), Some(InputFormat::Bam));
        assert_eq!(
            InputFormat::detect(Path::new("s1_R1.FASTQ.GZ")),
            Some(InputFormat::FastqGz)
        );
        assert_eq!(InputFormat::detect(Path::new("s1.fq")), Some(InputFormat::Fastq));
        assert_eq!(InputFormat::detect(Path::new("s1.sra")), None);
    }
}
