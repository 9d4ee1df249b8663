//! Configuration loading from TOML files

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use rnapipe_engine::{GraphBuilder, Quantifier, Resources, StageOverrides, Toolchain};

/// Global configuration for rnapipe
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub tools: Toolchain,
    pub resources: Resources,
    pub run: RunConfig,
    /// `[stages.<stage>]` tables: `force` / `fail_soft` per stage.
    pub stages: StageOverrides,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Samples are written to `<output_parent>/<sample>`.
    pub output_parent: PathBuf,
    pub cores: usize,
    pub quantifier: Quantifier,
}

impl Default for RunConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            output_parent: PathBuf::from("./pipeline_output"),
            cores: cpus.min(8),
            quantifier: Quantifier::default(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./rnapipe.toml (current directory)
    /// 2. ~/.config/rnapipe/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("rnapipe.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "rnapipe") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Stage graph builder carrying this configuration's tools, resources
    /// and per-stage overrides. `quantifier` overrides `[run].quantifier`.
    pub fn graph_builder(&self, new_start: bool, quantifier: Option<Quantifier>) -> GraphBuilder {
        GraphBuilder::new(self.tools.clone(), self.resources.clone())
            .with_overrides(self.stages.clone())
            .with_new_start(new_start)
            .with_quantifier(quantifier.unwrap_or(self.run.quantifier))
    }
}
