//! Export command for copying retained blocks out of a log

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::io::Write;
use std::path::PathBuf;

use wraplog::ReadError;

use super::ToolContext;

/// Copy retained blocks into a file
#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// Image file to read from
    pub image: PathBuf,

    /// Destination file
    pub output: PathBuf,

    /// First logical block to export (default: earliest retained block)
    #[arg(short, long)]
    pub start: Option<u32>,

    /// Number of blocks to export (default: all remaining)
    #[arg(short = 'n', long)]
    pub count: Option<u32>,

    /// Drop the block header from every exported block
    #[arg(long)]
    pub strip_headers: bool,
}

pub async fn run(ctx: &ToolContext, args: ExportArgs) -> Result<()> {
    let mut logger = ctx.attach(&args.image, true).await?;
    let state = logger.state();

    let start = args.start.unwrap_or(state.earliest_block);
    if start < state.earliest_block || start > state.current_block {
        return Err(anyhow!(
            "Block {} is outside the retained range {}..{}",
            start,
            state.earliest_block,
            state.current_block
        ));
    }
    let available = state.current_block - start;
    let count = args.count.map_or(available, |count| count.min(available));
    if args.count.map_or(false, |requested| requested > available) {
        warn!("Only {} blocks available from block {}", available, start);
    }

    let mut output = std::fs::File::create(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    let skip = if args.strip_headers {
        state.block_overhead as usize
    } else {
        0
    };

    let mut block = vec![0u8; state.block_size as usize];
    for idx in start..start + count {
        match logger.read(idx, 0, &mut block).await {
            Ok(()) => output.write_all(&block[skip..])?,
            Err(ReadError::NotFound) => {
                return Err(anyhow!("Block {} is no longer retained", idx));
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read block {}", idx)),
        }
    }
    output.flush()?;

    info!("Exported blocks {}..{}", start, start + count);
    println!(
        "Exported {} blocks to {}",
        count,
        args.output.display()
    );
    Ok(())
}
