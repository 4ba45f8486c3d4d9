//! `state <id>` - emits the OCI state JSON on stdout.

use anyhow::{Context as _, Result};
use clap::Parser;
use liblxcri::Runtime;

/// Show the OCI state of a container
#[derive(Parser, Debug)]
pub struct State {
    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}

pub fn state(args: State, runtime: &Runtime) -> Result<()> {
    let mut container = runtime
        .load(&args.container_id)
        .with_context(|| format!("failed to load container {}", args.container_id))?;
    let state = container
        .state()
        .with_context(|| format!("failed to read state of {}", args.container_id))?;
    container.release()?;

    println!("{}", serde_json::to_string_pretty(&state.oci)?);
    Ok(())
}
