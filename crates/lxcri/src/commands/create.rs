//! `create <id> --bundle <path>`

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use liblxcri::{bundle, Container, ContainerConfig, Context, CreateError, Runtime};

use crate::GlobalOpts;

/// Create a container from an OCI bundle
#[derive(Parser, Debug)]
pub struct Create {
    /// Path to the OCI bundle (rootfs plus config.json)
    #[clap(short, long, default_value = ".")]
    pub bundle: PathBuf,

    /// Unix socket that receives the PTY master file descriptor
    #[clap(long)]
    pub console_socket: Option<PathBuf>,

    /// File the monitor PID is written to
    #[clap(long)]
    pub pid_file: Option<PathBuf>,

    /// Name of the container instance
    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}

pub fn create(args: Create, runtime: &Runtime, ctx: &Context, global: &GlobalOpts) -> Result<()> {
    let spec = bundle::load_spec(&args.bundle)
        .with_context(|| "failed to load bundle spec")?;

    let config = ContainerConfig {
        container_id: args.container_id.clone(),
        bundle_path: args.bundle,
        spec,
        console_socket: args.console_socket,
        pid_file: args.pid_file,
        systemd_cgroup: global.systemd_cgroup,
        log_file: global.log.clone(),
        log_level: global.log_level.clone(),
        ..Default::default()
    };

    let mut container: Container = match runtime.create(ctx, config) {
        Ok(container) => container,
        Err(CreateError { container, error }) => {
            // partial progress is cleanable; best effort so the create
            // error stays the primary failure
            if let Some(mut partial) = container {
                let id = partial.id().to_string();
                let _ = partial.release();
                if let Err(cleanup_err) = runtime.delete(&Context::background(), &id, true) {
                    tracing::warn!(%cleanup_err, "cleanup after failed create failed");
                }
            }
            return Err(error).context("failed to create container");
        }
    };

    container.release().context("failed to release container")?;
    Ok(())
}
