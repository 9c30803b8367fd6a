//! QuantumFS CLI - administrative client for a mounted instance
//!
//! Every subcommand opens the mounted workspace's `/api` file, writes one
//! JSON command, and prints the JSON response it reads back.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::branch::BranchCommand;
use commands::completions::CompletionsCommand;
use commands::merge::MergeCommand;
use commands::status::StatusCommand;
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "quantumfs", version, about = "Administer a mounted QuantumFS instance")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a new workspace from an existing one's current state
    Branch(BranchCommand),
    /// Three-way merge a remote workspace's changes into a local one
    Merge(MergeCommand),
    /// Report a workspace's current root key and nonce
    Status(StatusCommand),
    /// Generate shell completions
    Completions(CompletionsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };

    match cli.command {
        Commands::Branch(cmd) => cmd.execute(format).await,
        Commands::Merge(cmd) => cmd.execute(format).await,
        Commands::Status(cmd) => cmd.execute(format).await,
        Commands::Completions(cmd) => cmd.execute(format).await,
    }
}
