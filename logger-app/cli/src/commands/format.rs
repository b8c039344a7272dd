//! Format command for creating erased log images

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::io::Write;
use std::path::PathBuf;

use wraplog::FileBackend;

use super::ToolContext;

/// Create an erased log image
#[derive(Parser, Debug)]
#[command(about = "Create an erased wraplog image")]
pub struct FormatArgs {
    /// Image file to create
    pub image: PathBuf,

    /// Number of physical blocks in the image
    #[arg(short, long)]
    pub blocks: u32,

    /// Overwrite an existing file without confirmation
    #[arg(short, long)]
    pub force: bool,
}

pub async fn run(ctx: &ToolContext, args: FormatArgs) -> Result<()> {
    let backend_config = &ctx.config.backend;
    let erase_blocks = (backend_config.erase_size / backend_config.block_size) as u32;

    if args.blocks == 0 || args.blocks % erase_blocks != 0 {
        return Err(anyhow!(
            "Block count {} must be a non-zero multiple of the {} block erase unit",
            args.blocks,
            erase_blocks
        ));
    }

    if args.image.exists() && !args.force {
        println!(
            "WARNING: {} already exists and will be overwritten.",
            args.image.display()
        );
        print!("Are you sure you want to continue? [y/N] ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    info!(
        "Formatting {} with {} blocks of {} bytes",
        args.image.display(),
        args.blocks,
        backend_config.block_size
    );

    let mut backend = FileBackend::create(&args.image, backend_config, args.blocks)
        .await
        .with_context(|| format!("Failed to create image {}", args.image.display()))?;
    backend.sync().await?;

    println!(
        "Created {} ({} blocks, {} byte blocks, {} byte erase units)",
        args.image.display(),
        args.blocks,
        backend_config.block_size,
        backend_config.erase_size
    );
    Ok(())
}
