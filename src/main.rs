mod commands;
mod render;
mod script;
mod tracing_setup;
mod utils;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::tracing_setup::Verbosity;

#[derive(Parser)]
#[command(name = "bloomcal")]
#[command(about = "Replay calendar sessions against the bloomcal sync engine")]
struct Cli {
    /// Show debug logs from the engine
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted session against in-memory stores
    Replay {
        /// Path to the replay script (TOML)
        script: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the configuration, or write a default one
    Config {
        /// Create a commented default config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_setup::init_subscriber(Verbosity::from_flags(cli.verbose, cli.quiet));

    match cli.command {
        Commands::Replay { script, json } => commands::replay::run(&script, json).await,
        Commands::Config { init } => commands::config::run(init),
    }
}
