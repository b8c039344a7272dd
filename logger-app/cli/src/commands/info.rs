//! Info command for showing the recovered log state

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use super::ToolContext;

/// Show the recovered state of a log image
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Image file to inspect
    pub image: PathBuf,

    /// Print the state as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(ctx: &ToolContext, args: InfoArgs) -> Result<()> {
    let logger = ctx.attach(&args.image, true).await?;
    let state = logger.state();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("Image:            {}", args.image.display());
    println!("Block size:       {} bytes", state.block_size);
    println!("Erase unit:       {} bytes", state.erase_unit);
    println!("Physical blocks:  {}", state.physical_blocks);
    println!("Logical blocks:   {}", state.logical_blocks);
    println!("Current block:    {}", state.current_block);
    println!("Earliest block:   {}", state.earliest_block);
    println!("Retained blocks:  {}", state.retained_blocks());
    if state.logical_blocks > 0 {
        let used = state.current_block as f64 / state.logical_blocks as f64 * 100.0;
        println!("Lifetime used:    {:.2}%", used);
    }
    Ok(())
}
