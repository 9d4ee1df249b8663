//! Cleanup manager: retention policy for intermediate artifacts
//!
//! Unconditional entries are removed as soon as the declaring stage and every
//! stage consuming a matching path have succeeded in this run. Conditional
//! entries are removed only when the whole run completes and kept otherwise,
//! for diagnosis.

use std::fs;
use std::path::{Path, PathBuf};

use crate::run::RunState;
use crate::stage::Stage;

/// A path or glob pattern scheduled for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupEntry {
    pub pattern: String,
    pub conditional: bool,
}

impl CleanupEntry {
    /// Delete only once the run reaches `completed`.
    pub fn conditional(pattern: impl AsRef<Path>) -> Self {
        Self {
            pattern: pattern.as_ref().to_string_lossy().into_owned(),
            conditional: true,
        }
    }

    /// Delete once every consumer has succeeded, whatever the run outcome.
    pub fn unconditional(pattern: impl AsRef<Path>) -> Self {
        Self {
            pattern: pattern.as_ref().to_string_lossy().into_owned(),
            conditional: false,
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        match glob::Pattern::new(&self.pattern) {
            Ok(pattern) => pattern.matches_path(path),
            Err(_) => Path::new(&self.pattern) == path,
        }
    }

    /// Remove everything the pattern currently matches.
    fn remove(&self) -> Vec<PathBuf> {
        let paths: Vec<PathBuf> = match glob::glob(&self.pattern) {
            Ok(iter) => iter.filter_map(|p| p.ok()).collect(),
            Err(_) => vec![PathBuf::from(&self.pattern)],
        };
        let mut removed = Vec::new();
        for path in paths {
            let result = match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
                Ok(_) => fs::remove_file(&path),
                Err(_) => continue,
            };
            match result {
                Ok(()) => removed.push(path),
                Err(e) => log::warn!("cleanup: cannot remove {}: {e}", path.display()),
            }
        }
        removed
    }
}

#[derive(Debug)]
struct Tracked {
    entry: CleanupEntry,
    declared_by: usize,
    consumers: Vec<usize>,
    done: bool,
}

/// Registry of cleanup entries declared across a stage list.
#[derive(Debug, Default)]
pub struct CleanupManager {
    tracked: Vec<Tracked>,
}

impl CleanupManager {
    /// Collect every stage's declarations and resolve their consumers.
    pub fn from_stages(stages: &[Stage]) -> Self {
        let mut tracked = Vec::new();
        for (idx, stage) in stages.iter().enumerate() {
            for entry in &stage.cleanup {
                let consumers = stages
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.inputs.iter().any(|p| entry.matches(p)))
                    .map(|(i, _)| i)
                    .collect();
                tracked.push(Tracked {
                    entry: entry.clone(),
                    declared_by: idx,
                    consumers,
                    done: false,
                });
            }
        }
        Self { tracked }
    }

    /// Whether `path` is scheduled for cleanup by any entry.
    pub fn covers(&self, path: &Path) -> bool {
        self.tracked.iter().any(|t| t.entry.matches(path))
    }

    /// Remove unconditional entries whose declarer and consumers have all
    /// settled. `settled[i]` is true once stage `i` completed or was skipped.
    pub fn reclaim(&mut self, settled: &[bool]) -> Vec<PathBuf> {
        let is_settled = |i: usize| settled.get(i).copied().unwrap_or(false);
        let mut removed = Vec::new();
        for tracked in &mut self.tracked {
            if tracked.done || tracked.entry.conditional {
                continue;
            }
            if is_settled(tracked.declared_by) && tracked.consumers.iter().all(|&i| is_settled(i)) {
                let paths = tracked.entry.remove();
                for path in &paths {
                    log::info!("cleanup: removed {}", path.display());
                }
                removed.extend(paths);
                tracked.done = true;
            }
        }
        removed
    }

    /// Apply retention at run termination.
    ///
    /// `completed`: every conditional entry is removed.
    /// Any other state: conditional entries stay on disk.
    pub fn finalize(&mut self, state: RunState) -> Vec<PathBuf> {
        let pending: Vec<&mut Tracked> = self
            .tracked
            .iter_mut()
            .filter(|t| !t.done && t.entry.conditional)
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }
        if state != RunState::Completed {
            log::info!(
                "cleanup: run {state}, keeping {} conditional intermediates",
                pending.len()
            );
            return Vec::new();
        }
        let mut removed = Vec::new();
        for tracked in pending {
            let paths = tracked.entry.remove();
            for path in &paths {
                log::info!("cleanup: removed {}", path.display());
            }
            removed.extend(paths);
            tracked.done = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageId;

    #[test]
    fn glob_and_literal_matching() {
        let entry = CleanupEntry::conditional("/o/fastq/s1*.fastq");
        assert!(entry.matches(Path::new("/o/fastq/s1_R1.fastq")));
        assert!(entry.matches(Path::new("/o/fastq/s1_R1_trimmed.fastq")));
        assert!(!entry.matches(Path::new("/o/fastq/s1_R1.fastq.gz")));

        let literal = CleanupEntry::unconditional("/o/bowtie1_hg38/s1.aln.sam");
        assert!(literal.matches(Path::new("/o/bowtie1_hg38/s1.aln.sam")));
        assert!(!literal.matches(Path::new("/o/bowtie1_hg38/s1.aln.bam")));
    }

    #[test]
    fn consumers_are_resolved_from_inputs() {
        let stages = vec![
            Stage::new(StageId::Align)
                .output("/o/s.sam")
                .clean(CleanupEntry::unconditional("/o/s.sam")),
            Stage::new(StageId::Sort).input("/o/s.sam"),
            Stage::new(StageId::Quantify).input("/o/s.sam"),
        ];
        let manager = CleanupManager::from_stages(&stages);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.tracked[0].consumers, vec![1, 2]);
        assert!(manager.covers(Path::new("/o/s.sam")));
    }

    #[test]
    fn unconditional_waits_for_all_consumers() {
        let dir = tempfile::tempdir().unwrap();
        let sam = dir.path().join("s.sam");
        fs::write(&sam, b"@HD").unwrap();

        let stages = vec![
            Stage::new(StageId::Align)
                .output(&sam)
                .clean(CleanupEntry::unconditional(&sam)),
            Stage::new(StageId::Sort).input(&sam),
            Stage::new(StageId::Quantify).input(&sam),
        ];
        let mut manager = CleanupManager::from_stages(&stages);

        assert!(manager.reclaim(&[true, true, false]).is_empty());
        assert!(sam.exists());

        assert_eq!(manager.reclaim(&[true, true, true]), vec![sam.clone()]);
        assert!(!sam.exists());
    }

    #[test]
    fn conditional_survives_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let fq = dir.path().join("s_R1.fastq");
        fs::write(&fq, b"@r").unwrap();

        let stages = vec![
            Stage::new(StageId::FastqConversion)
                .output(&fq)
                .clean(CleanupEntry::conditional(dir.path().join("s*.fastq"))),
        ];
        let mut manager = CleanupManager::from_stages(&stages);

        assert!(manager.reclaim(&[true]).is_empty());
        assert!(manager.finalize(RunState::Failed).is_empty());
        assert!(manager.finalize(RunState::Interrupted).is_empty());
        assert!(fq.exists());

        assert_eq!(manager.finalize(RunState::Completed), vec![fq.clone()]);
        assert!(!fq.exists());
    }
}
