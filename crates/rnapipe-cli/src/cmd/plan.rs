//! `rnapipe plan` - show the stage list and what a run would execute

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use rnapipe_engine::hash::fingerprint;
use rnapipe_engine::{CheckpointRecord, CleanupManager, Decision, assess};

use super::SampleArgs;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub sample: SampleArgs,

    /// Plan as if --new-start were given
    #[arg(long)]
    pub new_start: bool,

    /// Print every stage's command lines
    #[arg(long)]
    pub commands: bool,
}

pub fn run(args: PlanArgs, config: &Config) -> Result<()> {
    let spec = args.sample.spec(config)?;
    let builder = config.graph_builder(args.new_start, args.sample.quantifier);
    let stages = builder.build(&spec, args.sample.flags())?;
    if let Err(e) = builder.check_references(&spec, args.sample.flags()) {
        log::warn!("{e}; a run would stop before the first stage");
    }
    let decisions = assess(&stages, &CleanupManager::from_stages(&stages));
    let checkpoint = CheckpointRecord::load(&spec.identity().outdir)?;

    println!("=== Pipeline Plan: {} ===", spec.identity());
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Reason").fg(Color::Cyan),
        ]);

    for (idx, (stage, decision)) in stages.iter().zip(&decisions).enumerate() {
        let (status, mut reason) = match decision {
            Decision::Fresh => (Cell::new("FRESH").fg(Color::Green), String::new()),
            Decision::Reclaimed => (
                Cell::new("FRESH").fg(Color::Green),
                "intermediates cleaned up".to_string(),
            ),
            Decision::Run(reason) => (Cell::new("NEEDS_RUN").fg(Color::Yellow), reason.to_string()),
        };
        let mut name = stage.id.to_string();
        if stage.fail_soft {
            name.push_str(" (soft)");
        }
        let changed = checkpoint
            .as_ref()
            .and_then(|c| c.completed.get(&stage.id))
            .is_some_and(|mark| mark.fingerprint != fingerprint(stage));
        if changed {
            if !reason.is_empty() {
                reason.push_str("; ");
            }
            reason.push_str("command changed since last completion");
        }
        table.add_row(vec![Cell::new(idx + 1), Cell::new(name), status, Cell::new(reason)]);
    }
    println!("{table}");

    let pending = decisions.iter().filter(|d| !d.is_satisfied()).count();
    println!("{pending} of {} stages would run", stages.len());

    if args.commands {
        for stage in &stages {
            println!("\n# {}", stage.id);
            for command in &stage.commands {
                println!("{command}");
            }
        }
    }
    Ok(())
}
