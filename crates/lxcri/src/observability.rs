//! Tracing setup for the CLI: text or JSON events to stderr or a log
//! file.

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tracing::Level;
use tracing_subscriber::prelude::*;

use crate::GlobalOpts;

const LOG_FORMAT_TEXT: &str = "text";
const LOG_FORMAT_JSON: &str = "json";

enum LogFormat {
    Text,
    Json,
}

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";
#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "warn";

fn detect_log_format(log_format: Option<&str>) -> Result<LogFormat> {
    match log_format {
        None | Some(LOG_FORMAT_TEXT) => Ok(LogFormat::Text),
        Some(LOG_FORMAT_JSON) => Ok(LogFormat::Json),
        Some(unknown) => bail!("unknown log format: {unknown}"),
    }
}

fn detect_log_level(input: Option<&str>) -> Result<Level> {
    let level = input.unwrap_or(DEFAULT_LOG_LEVEL);
    Level::from_str(level).with_context(|| format!("invalid log level {level:?}"))
}

pub fn init(opts: &GlobalOpts) -> Result<()> {
    let level = detect_log_level(opts.log_level.as_deref())?;
    let level_filter = tracing_subscriber::filter::LevelFilter::from(level);
    let format = detect_log_format(opts.log_format.as_deref())?;
    let registry = tracing_subscriber::registry().with(level_filter);

    fn init_err(err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("failed to init logger: {err}")
    }

    match (&opts.log, format) {
        (None, LogFormat::Text) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(init_err)?,
        (None, LogFormat::Json) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(init_err)?,
        (Some(path), format) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            match format {
                LogFormat::Text => registry
                    .with(tracing_subscriber::fmt::layer().with_writer(file))
                    .try_init()
                    .map_err(init_err)?,
                LogFormat::Json => registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .flatten_event(true)
                            .with_span_list(false)
                            .with_writer(file),
                    )
                    .try_init()
                    .map_err(init_err)?,
            }
        }
    }

    Ok(())
}
