//! `rnapipe run` - process one sample, resuming from earlier attempts

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use rnapipe_core::SharedProgress;
use rnapipe_engine::{Runner, StageStatus};

use super::{SampleArgs, display_metric};
use crate::config::Config;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub sample: SampleArgs,

    /// Execute every stage, ignoring existing outputs
    #[arg(long)]
    pub new_start: bool,

    /// Remove a run lock left behind by a process killed with SIGKILL or
    /// a crash. A second Ctrl-C removes the lock itself before exiting.
    #[arg(long)]
    pub recover: bool,
}

pub fn run(args: RunArgs, config: &Config, progress: &SharedProgress) -> Result<()> {
    let spec = args.sample.spec(config)?;
    let flags = args.sample.flags();
    let builder = config.graph_builder(args.new_start, args.sample.quantifier);

    rnapipe_core::install_signal_handlers().context("cannot install signal handlers")?;

    let summary = Runner::new(rnapipe_core::shutdown_flag())
        .with_progress(progress.clone())
        .with_recover(args.recover)
        .run_sample(&builder, &spec, flags)?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
        ]);
    for (id, status) in &summary.stages {
        let color = match status {
            StageStatus::Completed => Color::Green,
            StageStatus::Skipped => Color::DarkGrey,
            StageStatus::Blocked => Color::Red,
            _ => Color::Yellow,
        };
        table.add_row(vec![Cell::new(id), Cell::new(status).fg(color)]);
    }
    progress.println(format!("\n{table}"));

    let mut metrics = Table::new();
    metrics
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Metric").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);
    for (key, value) in &summary.metrics {
        metrics.add_row(vec![Cell::new(key), Cell::new(display_metric(value))]);
    }
    progress.println(format!("{metrics}"));
    progress.println(format!(
        "{}: {} ({} executed, {} skipped, {} blocked, {} intermediates removed)",
        summary.identity,
        summary.state,
        summary.executed().len(),
        summary.skipped().len(),
        summary.blocked().len(),
        summary.removed.len()
    ));
    Ok(())
}
