mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::config::ConfigAction;
use commands::run::RunOptions;

#[derive(Parser)]
#[command(name = "nudgeflow")]
#[command(about = "Flow sessions with focus nudges", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a flow session in this terminal
    Run {
        /// Session length in minutes
        #[arg(short, long, default_value = "25")]
        minutes: u32,
        /// Energy hint passed to the sequencing service (low, medium, high)
        #[arg(short, long)]
        energy: Option<String>,
        /// TOML task plan (defaults to plan.toml in the data directory)
        #[arg(short, long)]
        plan: Option<PathBuf>,
        /// Base URL of the flow service; replaces the local plan
        #[arg(long)]
        api: Option<String>,
        /// API key sent as X-Api-Key
        #[arg(long, env = "NUDGEFLOW_API_KEY")]
        api_key: Option<String>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    match cli.command {
        Commands::Run {
            minutes,
            energy,
            plan,
            api,
            api_key,
        } => {
            commands::run::run_command(RunOptions {
                minutes,
                energy,
                plan,
                api,
                api_key,
            })
            .await
        }
        Commands::Config { action } => commands::config::handle_config_command(&action),
    }
}
