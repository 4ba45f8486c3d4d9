//! `kill <id> <signal>`

use anyhow::{Context as _, Result};
use clap::Parser;
use liblxcri::signal::Signal;
use liblxcri::{Context, Runtime};

/// Send a signal to the container's processes
#[derive(Parser, Debug)]
pub struct Kill {
    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,

    /// Signal name (TERM, SIGTERM) or number (15)
    #[clap(default_value = "SIGTERM")]
    pub signal: String,
}

pub fn kill(args: Kill, runtime: &Runtime, ctx: &Context) -> Result<()> {
    let signal: Signal = args
        .signal
        .parse()
        .with_context(|| format!("invalid signal {:?}", args.signal))?;
    let mut container = runtime
        .load(&args.container_id)
        .with_context(|| format!("failed to load container {}", args.container_id))?;
    runtime
        .kill(ctx, &mut container, signal)
        .with_context(|| format!("failed to kill container {}", args.container_id))?;
    container.release()?;
    Ok(())
}
