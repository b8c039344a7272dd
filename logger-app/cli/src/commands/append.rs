//! Append command for logging a file as block records

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Instant;

use super::ToolContext;

/// Append a file to the log
#[derive(Parser, Debug)]
pub struct AppendArgs {
    /// Image file to write to
    pub image: PathBuf,

    /// File whose contents are logged
    pub input: PathBuf,

    /// Block type tag stored with every record
    #[arg(short = 't', long = "type", default_value_t = 0)]
    pub block_type: u8,
}

pub async fn run(ctx: &ToolContext, args: AppendArgs) -> Result<()> {
    let data = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let mut logger = ctx.attach(&args.image, false).await?;
    let state = logger.state();

    let overhead = state.block_overhead as usize;
    let payload = state.block_size as usize - overhead;
    if payload == 0 {
        return Err(anyhow!("Blocks of {} bytes have no room for data", state.block_size));
    }

    let start = Instant::now();
    let mut written = 0;
    for chunk in data.chunks(payload) {
        let mut record = vec![0u8; overhead];
        record.extend_from_slice(chunk);
        logger
            .write(args.block_type, &record)
            .await
            .with_context(|| format!("Failed to write record {}", written))?;
        written += 1;
    }
    logger.flush().await.context("Failed to flush buffered records")?;

    let state = logger.state();
    info!("Appended {} records in {} ms", written, start.elapsed().as_millis());
    println!(
        "Appended {} bytes as {} blocks (now {}/{} blocks, earliest {})",
        data.len(),
        written,
        state.current_block,
        state.logical_blocks,
        state.earliest_block
    );
    Ok(())
}
