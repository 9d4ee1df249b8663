//! Run lock: one active run per sample output directory
//!
//! The lock is a file created with `create_new`, so acquisition is atomic on
//! local filesystems. It is removed when the guard drops, which covers every
//! terminal transition including interrupts unwinding through the driver.
//! A forced exit on a second signal removes it from the signal handler.
//! Only SIGKILL or a crash leaves it behind; `--recover` clears that.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const LOCK_FILE: &str = "rnapipe.lock";

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub sample: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    /// Read the holder of a lock file, if it exists and parses.
    pub fn read(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn describe(path: &Path) -> String {
        match Self::read(path) {
            Some(info) => format!(
                "pid {} (sample {}, since {})",
                info.pid,
                info.sample,
                info.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => "an unknown process".to_string(),
        }
    }
}

/// Held run lock. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock in `outdir`, failing with `PipelineError::Lock` when
    /// another run holds it.
    pub fn acquire(outdir: &Path, sample: &str) -> Result<Self> {
        let path = outdir.join(LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let info = LockInfo {
                    pid: std::process::id(),
                    sample: sample.to_string(),
                    acquired_at: Utc::now(),
                };
                let payload = serde_json::to_string(&info)
                    .map_err(|e| PipelineError::io(&path, io::Error::other(e)))?;
                let written = file
                    .write_all(payload.as_bytes())
                    .and_then(|()| file.sync_all());
                if let Err(e) = written {
                    let _ = fs::remove_file(&path);
                    return Err(PipelineError::io(&path, e));
                }
                log::debug!("acquired run lock {}", path.display());
                rnapipe_core::guard_lock_file(&path);
                Ok(Self { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(PipelineError::Lock {
                holder: LockInfo::describe(&path),
                path,
            }),
            Err(e) => Err(PipelineError::io(&path, e)),
        }
    }

    /// Remove a lock left behind by a killed process. Returns the removed
    /// holder, if any.
    pub fn recover(outdir: &Path) -> Result<Option<LockInfo>> {
        let path = outdir.join(LOCK_FILE);
        let info = LockInfo::read(&path);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::warn!(
                    "removed stale run lock {} held by {}",
                    path.display(),
                    info.as_ref()
                        .map(|i| format!("pid {}", i.pid))
                        .unwrap_or_else(|| "an unknown process".into())
                );
                Ok(info)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::io(&path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for RunLock {
    fn drop(&mut self) {
        rnapipe_core::unguard_lock_file();
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("released run lock {}", self.path.display()),
            Err(e) => log::warn!("cannot remove run lock {}: {e}", self.path.display()),
        }
    }
}
