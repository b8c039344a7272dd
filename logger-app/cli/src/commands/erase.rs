//! Erase command for resetting a log image

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;

use super::ToolContext;

/// Erase the log
#[derive(Parser, Debug)]
pub struct EraseArgs {
    /// Image file to erase
    pub image: PathBuf,

    /// Erase the whole medium instead of only the written blocks
    #[arg(short, long)]
    pub all: bool,
}

pub async fn run(ctx: &ToolContext, args: EraseArgs) -> Result<()> {
    let mut logger = ctx.attach(&args.image, false).await?;
    let before = logger.state();
    let total = if args.all {
        before.physical_blocks
    } else {
        before.current_block.min(before.physical_blocks)
    };

    let progress = move |erased: u32| {
        print!("\rErased {}/{} blocks", erased, total);
        let _ = std::io::stdout().flush();
    };
    logger
        .erase(args.all, Some(&progress))
        .await
        .with_context(|| format!("Failed to erase {}", args.image.display()))?;
    logger.backend_mut().sync().await?;

    println!();
    println!(
        "Erased {} (was {}/{} blocks)",
        args.image.display(),
        before.current_block,
        before.logical_blocks
    );
    Ok(())
}
