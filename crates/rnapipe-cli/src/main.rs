//! rnapipe - Checkpointed RNA bisulfite-seq pipeline driver
//!
//! Runs one sample through merge, FASTQ conversion, trimming, alignment,
//! filtering, deduplication and BitSeq quantification (or kallisto straight
//! after trimming), resuming from whatever earlier attempts left on disk.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;
use rnapipe_engine::{EXIT_FAILED, PipelineError};

#[derive(Parser)]
#[command(name = "rnapipe")]
#[command(about = "Checkpointed RNA bisulfite-seq pipeline driver")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file path (default: ./rnapipe.toml or ~/.config/rnapipe/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline for one sample
    Run(cmd::run::RunArgs),
    /// Show which stages a run would execute, without running anything
    Plan(cmd::plan::PlanArgs),
    /// Show checkpoint, lock and metrics of a sample output directory
    Status(cmd::status::StatusArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(rnapipe_core::ProgressContext::new());
    let multi = if progress.is_tty() {
        Some(progress.multi())
    } else {
        None
    };
    rnapipe_core::init_logging(cli.quiet, cli.debug, multi);

    match dispatch(cli, &progress) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let pipeline = err.downcast_ref::<PipelineError>();
            eprintln!("Error: {err:#}");
            if pipeline.is_some_and(PipelineError::is_resumable) {
                eprintln!("Progress is checkpointed; re-run the same command to resume.");
            }
            ExitCode::from(pipeline.map_or(EXIT_FAILED, PipelineError::exit_code))
        }
    }
}

fn dispatch(cli: Cli, progress: &rnapipe_core::SharedProgress) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run(args) => cmd::run::run(args, &config, progress),
        Command::Plan(args) => cmd::plan::run(args, &config),
        Command::Status(args) => cmd::status::run(args),
        Command::Config => {
            use comfy_table::{
                Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
            };

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec![
                    Cell::new("Setting").fg(Color::Cyan),
                    Cell::new("Value").fg(Color::Cyan),
                ]);

            let tools = &config.tools;
            table.add_row(vec!["java", &format!("{} (-Xmx{})", tools.java, tools.java_memory)]);
            table.add_row(vec!["samtools", &tools.samtools]);
            table.add_row(vec!["bowtie1", &tools.bowtie1]);
            table.add_row(vec!["bowtie2", &tools.bowtie2]);
            table.add_row(vec!["python", &tools.python]);
            table.add_row(vec!["Rscript", &tools.rscript]);
            table.add_row(vec!["kallisto", &tools.kallisto]);
            table.add_row(vec!["Trimmomatic jar", &tools.trimmomatic_jar.display().to_string()]);
            table.add_row(vec!["Picard jar", &tools.picard_jar.display().to_string()]);

            let resources = &config.resources;
            table.add_row(vec!["Genomes", &resources.genomes.display().to_string()]);
            table.add_row(vec!["Adapters", &resources.adapters.display().to_string()]);
            table.add_row(vec!["Scripts", &resources.scripts.display().to_string()]);

            table.add_row(vec![
                "Output parent",
                &config.run.output_parent.display().to_string(),
            ]);
            table.add_row(vec!["Cores", &config.run.cores.to_string()]);
            table.add_row(vec!["Quantifier", config.run.quantifier.name()]);

            for (stage, over) in &config.stages {
                let mut parts = Vec::new();
                if let Some(force) = over.force {
                    parts.push(format!("force={force}"));
                }
                if let Some(fail_soft) = over.fail_soft {
                    parts.push(format!("fail_soft={fail_soft}"));
                }
                table.add_row(vec![&format!("stage {stage}"), &parts.join(", ")]);
            }

            eprintln!("\n{table}");
            Ok(())
        }
    }
}
