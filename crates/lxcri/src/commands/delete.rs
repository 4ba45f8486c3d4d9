//! `delete <id> [--force]`

use anyhow::{Context as _, Result};
use clap::Parser;
use liblxcri::{Context, Runtime};

/// Release all resources held by the container
#[derive(Parser, Debug)]
pub struct Delete {
    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,

    /// Delete a container that is not stopped (sends SIGKILL)
    #[clap(short, long)]
    pub force: bool,
}

pub fn delete(args: Delete, runtime: &Runtime, ctx: &Context) -> Result<()> {
    runtime
        .delete(ctx, &args.container_id, args.force)
        .with_context(|| format!("failed to delete container {}", args.container_id))
}
