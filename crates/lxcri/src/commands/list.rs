//! `list` - tabular overview of all containers under the runtime root.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Local};
use clap::Parser;
use liblxcri::Runtime;
use tabwriter::TabWriter;

/// List containers
#[derive(Parser, Debug)]
pub struct List {
    /// Only print container ids
    #[clap(long, short)]
    pub quiet: bool,
}

pub fn list(args: List, runtime: &Runtime) -> Result<()> {
    let ids = runtime.list()?;
    if args.quiet {
        for id in ids {
            println!("{id}");
        }
        return Ok(());
    }

    let mut tab_writer = TabWriter::new(std::io::stdout());
    writeln!(&mut tab_writer, "ID\tPID\tSTATUS\tCREATED")?;
    for id in ids {
        let mut container = match runtime.load(&id) {
            Ok(container) => container,
            Err(err) => {
                tracing::warn!(id = %id, %err, "skipping unloadable container");
                continue;
            }
        };
        let status = container
            .status()
            .map(|status| status.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let created: DateTime<Local> = container.created_at.into();
        writeln!(
            &mut tab_writer,
            "{id}\t{}\t{status}\t{}",
            container.monitor_pid,
            created.to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
        )?;
        let _ = container.release();
    }
    tab_writer.flush()?;
    Ok(())
}
