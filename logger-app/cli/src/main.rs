//! wraplog Command Line Interface
//!
//! Operator tool for block log images.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use std::path::PathBuf;

mod commands;

/// wraplog - circular block log images
#[derive(Parser)]
#[command(
    name = "wraplog",
    about = "wraplog command-line interface",
    version = env!("CARGO_PKG_VERSION"),
    author = "Wraplog Contributors"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Block size in bytes
    #[arg(long, global = true)]
    block_size: Option<u16>,

    /// Erase unit size in bytes
    #[arg(long, global = true)]
    erase_size: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an erased log image
    Format(commands::format::FormatArgs),

    /// Show the recovered state of a log image
    Info(commands::info::InfoArgs),

    /// Append a file to the log as block records
    Append(commands::append::AppendArgs),

    /// Copy retained blocks out of the log
    Export(commands::export::ExportArgs),

    /// Erase the log
    Erase(commands::erase::EraseArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(log_level).init();

    info!("wraplog CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    let ctx = commands::ToolContext::load(cli.config.as_ref(), cli.block_size, cli.erase_size)?;

    match cli.command {
        Commands::Format(args) => commands::format::run(&ctx, args).await,
        Commands::Info(args) => commands::info::run(&ctx, args).await,
        Commands::Append(args) => commands::append::run(&ctx, args).await,
        Commands::Export(args) => commands::export::run(&ctx, args).await,
        Commands::Erase(args) => commands::erase::run(&ctx, args).await,
    }
}
