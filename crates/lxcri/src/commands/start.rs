//! `start <id>`

use anyhow::{Context as _, Result};
use clap::Parser;
use liblxcri::{Context, Runtime};

/// Start the user process of a created container
#[derive(Parser, Debug)]
pub struct Start {
    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}

pub fn start(args: Start, runtime: &Runtime, ctx: &Context) -> Result<()> {
    let mut container = runtime
        .load(&args.container_id)
        .with_context(|| format!("failed to load container {}", args.container_id))?;
    runtime
        .start(ctx, &mut container)
        .with_context(|| format!("failed to start container {}", args.container_id))?;
    container.release()?;
    Ok(())
}
