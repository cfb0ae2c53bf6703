use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "llmviz")]
#[command(about = "Run and validate the llmviz GPT compute pipeline", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run a forward pass over a weight file
    Run {
        /// Weight file (JSON tensor set with config)
        #[arg(short, long)]
        weights: PathBuf,

        /// Batch size (defaults to the config's, or 1)
        #[arg(short, long)]
        batch: Option<usize>,

        /// Comma separated prompt tokens, padded with 0 to the block size
        #[arg(short, long, value_delimiter = ',')]
        tokens: Vec<u32>,

        /// Predicted tokens to loop back into the input
        #[arg(short, long, default_value_t = 0)]
        steps: usize,

        /// Reference partials to validate against; their `idx` becomes the input
        #[arg(long)]
        validate: Option<PathBuf>,

        /// Validate against the built-in CPU reference
        #[arg(long)]
        reference: bool,

        /// Absolute validation tolerance
        #[arg(long)]
        tolerance: Option<f32>,
    },

    /// Write deterministic toy weights for the gpt-nano sorting model
    Synth {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,

        #[arg(long, default_value_t = 1337)]
        seed: u64,
    },

    /// List the pipeline's buffers and their extents
    Buffers {
        #[arg(short, long)]
        weights: PathBuf,

        #[arg(short, long)]
        batch: Option<usize>,
    },
}
