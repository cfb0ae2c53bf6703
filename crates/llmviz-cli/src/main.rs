mod commands;

use anyhow::Result;
use clap::Parser;

use llmviz_cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    match cli.command {
        Commands::Run {
            weights,
            batch,
            tokens,
            steps,
            validate,
            reference,
            tolerance,
        } => commands::run::run(
            &weights,
            batch,
            &tokens,
            steps,
            validate.as_deref(),
            reference,
            tolerance,
        ),

        Commands::Synth { out, seed } => commands::synth::run(&out, seed),

        Commands::Buffers { weights, batch } => commands::buffers::run(&weights, batch),
    }
}
