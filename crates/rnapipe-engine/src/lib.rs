//! rnapipe-engine - Staged, checkpointed execution for the RNA bisulfite pipeline
//!
//! The graph builder turns run-mode flags into an ordered list of stage
//! descriptors; the executor walks that list, skipping stages whose outputs
//! are fresh, validating conversions, recording metrics and reclaiming
//! intermediates. The runner wraps one sample's run in its lock.

pub mod artifact;
pub mod checkpoint;
pub mod cleanup;
pub mod commands;
pub mod error;
pub mod executor;
pub mod graph;
pub mod hash;
pub mod lock;
pub mod report;
pub mod run;
pub mod runner;
pub mod settings;
pub mod stage;
pub mod validation;

pub use artifact::{Artifact, Freshness, InputFormat};
pub use checkpoint::{CheckpointRecord, StageMark, CHECKPOINT_FILE};
pub use cleanup::{CleanupEntry, CleanupManager};
pub use error::{GateFailure, PipelineError, Result, EXIT_FAILED, EXIT_INTERRUPTED};
pub use executor::{assess, exit_code_key, Decision, Executor, RunReason, BLOCKED};
pub use graph::{GraphBuilder, SampleSpec};
pub use lock::{LockInfo, RunLock, LOCK_FILE};
pub use report::{MetricProbe, MetricValue, ResultReporter, STATS_FILE};
pub use run::{PipelineRun, RunFlags, RunIdentity, RunState};
pub use runner::{RunSummary, Runner};
pub use settings::{Quantifier, Resources, StageOverride, StageOverrides, Toolchain};
pub use stage::{CommandSpec, Stage, StageId, StageStatus};
pub use validation::{Counter, ValidationGate};
