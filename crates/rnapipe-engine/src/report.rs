//! Result reporter: run-scoped, insertion-ordered metrics record
//!
//! Persisted as `stats.tsv` (`key<TAB>value`) in the sample output
//! directory. Values loaded from a previous run are *carried*: a stage that
//! re-executes may replace its carried value once. Any second write of a key
//! within the same run is a reporting error.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::validation::Counter;

pub const STATS_FILE: &str = "stats.tsv";

/// A scalar metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(u64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    /// Parse a persisted value, preferring the narrowest type.
    pub fn parse(s: &str) -> Self {
        if let Ok(n) = s.parse::<u64>() {
            Self::Int(n)
        } else if let Ok(x) = s.parse::<f64>() {
            Self::Float(x)
        } else {
            Self::Text(s.to_string())
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x:.2}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for MetricValue {
    fn from(n: u64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for MetricValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for MetricValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    value: MetricValue,
    /// Written during this run (as opposed to carried from a previous one).
    reported: bool,
}

/// Append-only metrics record for one run.
#[derive(Debug, Default)]
pub struct ResultReporter {
    entries: Vec<Entry>,
    path: Option<PathBuf>,
}

impl ResultReporter {
    /// In-memory reporter (nothing persisted).
    pub fn new() -> Self {
        Self::default()
    }

    /// Reporter persisting to `outdir/stats.tsv`, carrying any values already there.
    pub fn open(outdir: &Path) -> Result<Self> {
        let path = outdir.join(STATS_FILE);
        let mut entries: Vec<Entry> = Vec::new();
        match fs::read_to_string(&path) {
            Ok(content) => {
                for line in content.lines() {
                    let Some((key, value)) = line.split_once('\t') else {
                        continue;
                    };
                    let value = MetricValue::parse(value);
                    match entries.iter_mut().find(|e| e.key == key) {
                        Some(existing) => existing.value = value,
                        None => entries.push(Entry {
                            key: key.to_string(),
                            value,
                            reported: false,
                        }),
                    }
                }
                log::debug!("carried {} metrics from {}", entries.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::io(&path, e)),
        }
        Ok(Self {
            entries,
            path: Some(path),
        })
    }

    /// Record `key → value`. A repeated key within this run is an error.
    pub fn report(&mut self, key: &str, value: impl Into<MetricValue>) -> Result<()> {
        let value = value.into();
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) if entry.reported => {
                return Err(PipelineError::Reporting {
                    key: key.to_string(),
                });
            }
            Some(entry) => {
                entry.value = value;
                entry.reported = true;
            }
            None => self.entries.push(Entry {
                key: key.to_string(),
                value,
                reported: true,
            }),
        }
        if let Some(entry) = self.entries.iter().find(|e| e.key == key) {
            log::info!("result: {} = {}", entry.key, entry.value);
        }
        self.flush()
    }

    pub fn get(&self, key: &str) -> Option<&MetricValue> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    /// All metrics in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.entries.iter().map(|e| (e.key.as_str(), &e.value))
    }

    /// Keys written during this run.
    pub fn reported_keys(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.reported)
            .map(|e| e.key.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite the stats file atomically (tmp → rename).
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.key);
            out.push('\t');
            out.push_str(&entry.value.to_string());
            out.push('\n');
        }
        let tmp = path.with_extension("tsv.tmp");
        fs::write(&tmp, out).map_err(|e| PipelineError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| PipelineError::io(path, e))?;
        Ok(())
    }
}

/// What a metric probe measures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricSource {
    Count(Counter),
    /// Combined size of files in megabytes.
    FileSizeMb(Vec<PathBuf>),
}

/// Post-completion measurement published as a run metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricProbe {
    pub key: String,
    pub source: MetricSource,
}

impl MetricProbe {
    pub fn count(key: impl Into<String>, counter: Counter) -> Self {
        Self {
            key: key.into(),
            source: MetricSource::Count(counter),
        }
    }

    pub fn file_size_mb<P: Into<PathBuf>>(
        key: impl Into<String>,
        paths: impl IntoIterator<Item = P>,
    ) -> Self {
        Self {
            key: key.into(),
            source: MetricSource::FileSizeMb(paths.into_iter().map(Into::into).collect()),
        }
    }

    pub fn measure(&self, cancel: &AtomicBool) -> std::result::Result<MetricValue, String> {
        match &self.source {
            MetricSource::Count(counter) => counter.count(cancel).map(MetricValue::Int),
            MetricSource::FileSizeMb(paths) => {
                let mut bytes = 0u64;
                for path in paths {
                    let meta = fs::metadata(path)
                        .map_err(|e| format!("{}: {e}", path.display()))?;
                    bytes += meta.len();
                }
                Ok(MetricValue::Float(bytes as f64 / (1024.0 * 1024.0)))
            }
        }
    }
}
