//! rnapipe-core - Common infrastructure for the rnapipe sequencing pipeline
//!
//! Logging, progress display, graceful shutdown and the blocking
//! subprocess runner used to invoke external genomics tools.

pub mod logging;
pub mod process;
pub mod progress;
pub mod shutdown;

// Re-exports for convenience
pub use logging::{IndicatifLogger, init_logging};
pub use process::{Captured, ProcessError, ProcessOutcome, run_captured, run_logged, tail_lines};
pub use progress::{ProgressContext, SharedProgress, finish_stage_line, fmt_num};
pub use shutdown::{guard_lock_file, install_signal_handlers, shutdown_flag, unguard_lock_file};
