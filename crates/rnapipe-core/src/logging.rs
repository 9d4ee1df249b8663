//! Logging setup: env_logger backend, optionally bridged through indicatif
//!
//! In a terminal, log lines are printed through the shared `MultiProgress`
//! so they land above the per-stage spinner lines instead of tearing them.

use std::io::Write;

use indicatif::MultiProgress;

const RESET: &str = "\x1b[0m";

/// Fixed-width label for a level, so stage names line up in the output.
fn level_label(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    }
}

fn level_color(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    }
}

/// Render one record for terminal output.
fn render_tty(record: &log::Record) -> String {
    let level = record.level();
    format!(
        "[{}{}{RESET}] {}",
        level_color(level),
        level_label(level),
        record.args()
    )
}

/// Logger that prints through indicatif MultiProgress to avoid mixing with spinners.
pub struct IndicatifLogger {
    inner: env_logger::Logger,
    multi: MultiProgress,
}

impl IndicatifLogger {
    pub fn new(inner: env_logger::Logger, multi: MultiProgress) -> Self {
        Self { inner, multi }
    }
}

impl log::Log for IndicatifLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.inner.enabled(record.metadata()) {
            return;
        }
        let line = render_tty(record);
        self.multi.suspend(|| eprintln!("{line}"));
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Default filter for the given verbosity flags. `RUST_LOG` still wins.
fn default_level(quiet: bool, debug: bool) -> &'static str {
    if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    }
}

/// Initialize logging.
///
/// With `multi` set (TTY), records go through [`IndicatifLogger`].
/// Without it, plain `[timestamp LEVEL] message` lines are written to stderr,
/// which is what ends up in cluster job logs.
pub fn init_logging(quiet: bool, debug: bool, multi: Option<&MultiProgress>) {
    let env = env_logger::Env::default().default_filter_or(default_level(quiet, debug));

    match multi {
        Some(multi) => {
            let logger = env_logger::Builder::from_env(env).build();
            let max_level = logger.filter();
            log::set_boxed_logger(Box::new(IndicatifLogger::new(logger, multi.clone())))
                .expect("failed to init logger");
            log::set_max_level(max_level);
        }
        None => {
            env_logger::Builder::from_env(env)
                .format(|buf, record| {
                    writeln!(
                        buf,
                        "[{} {}] {}",
                        buf.timestamp_seconds(),
                        level_label(record.level()),
                        record.args()
                    )
                })
                .init();
        }
    }
}
