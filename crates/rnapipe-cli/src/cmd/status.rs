//! `rnapipe status` - inspect a sample output directory

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use rnapipe_engine::hash::short_fingerprint;
use rnapipe_engine::{CheckpointRecord, LOCK_FILE, LockInfo, ResultReporter, RunState, StageId};

use super::display_metric;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Sample output directory (<output-parent>/<sample>)
    pub dir: PathBuf,
}

pub fn run(args: StatusArgs) -> Result<()> {
    let Some(record) = CheckpointRecord::load(&args.dir)? else {
        anyhow::bail!("no checkpoint in {} (sample never run)", args.dir.display());
    };

    let state_color = match record.state {
        RunState::Completed => Color::Green,
        RunState::Failed => Color::Red,
        _ => Color::Yellow,
    };
    let flags = record.flags;
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Run").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);
    table.add_row(vec![Cell::new("Sample"), Cell::new(&record.sample)]);
    table.add_row(vec![Cell::new("Output"), Cell::new(record.outdir.display())]);
    table.add_row(vec![Cell::new("State"), Cell::new(record.state).fg(state_color)]);
    table.add_row(vec![Cell::new("Attempts"), Cell::new(record.attempts)]);
    table.add_row(vec![
        Cell::new("Mode"),
        Cell::new(format!(
            "{}, filter {}, spike-in {}, {} trimming",
            flags.read_type(),
            on_off(flags.filter_enabled),
            on_off(flags.ercc_enabled),
            if flags.coreseq_mode { "CORE-seq" } else { "standard" }
        )),
    ]);
    table.add_row(vec![
        Cell::new("Last completed"),
        Cell::new(record.last_completed.map(StageId::name).unwrap_or("-")),
    ]);
    table.add_row(vec![
        Cell::new("Updated"),
        Cell::new(record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")),
    ]);
    let lock = match LockInfo::read(&args.dir.join(LOCK_FILE)) {
        Some(info) => format!(
            "held by pid {} since {}",
            info.pid,
            info.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None if args.dir.join(LOCK_FILE).exists() => "held (unreadable lock file)".to_string(),
        None => "free".to_string(),
    };
    table.add_row(vec![Cell::new("Lock"), Cell::new(lock)]);
    println!("{table}");

    if !record.completed.is_empty() {
        let mut stages = Table::new();
        stages
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Stage").fg(Color::Cyan),
                Cell::new("Completed").fg(Color::Cyan),
                Cell::new("Command").fg(Color::Cyan),
            ]);
        // execution order, not completion order
        for id in StageId::ALL {
            if let Some(mark) = record.completed.get(&id) {
                stages.add_row(vec![
                    Cell::new(id),
                    Cell::new(mark.completed_at.format("%Y-%m-%d %H:%M:%S")),
                    Cell::new(short_fingerprint(&mark.fingerprint)),
                ]);
            }
        }
        println!("{stages}");
    }

    let results = ResultReporter::open(&args.dir)?;
    if !results.is_empty() {
        let mut metrics = Table::new();
        metrics
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Metric").fg(Color::Cyan),
                Cell::new("Value").fg(Color::Cyan),
            ]);
        for (key, value) in results.entries() {
            metrics.add_row(vec![Cell::new(key), Cell::new(display_metric(value))]);
        }
        println!("{metrics}");
    }
    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}
