//! OCI runtime command line, a thin wrapper over liblxcri.
//!
//! Exit codes: 0 on success, 1 on runtime errors, 2 on invalid
//! arguments (from the argument parser).

mod commands;
mod observability;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use liblxcri::{Context, Runtime};

#[derive(Parser, Debug)]
#[clap(version, about = "lxcri is an OCI container runtime backed by liblxc")]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser, Debug)]
struct GlobalOpts {
    /// Root directory for container runtime state
    #[clap(long, default_value = "/run/lxcri")]
    root: PathBuf,

    /// Directory containing lxcri-start, lxcri-hook and lxcri-init
    #[clap(long, env = "LIBEXEC_DIR", default_value = "/usr/local/libexec/lxcri")]
    libexec_dir: PathBuf,

    /// Log file; defaults to stderr
    #[clap(long)]
    log: Option<PathBuf>,

    /// Log format (text or json)
    #[clap(long)]
    log_format: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long)]
    log_level: Option<String>,

    /// Interpret cgroups paths as systemd encoded (slice:prefix:name)
    #[clap(long)]
    systemd_cgroup: bool,

    /// Cgroup (relative to the cgroup root) for the monitor processes
    #[clap(long)]
    monitor_cgroup: Option<String>,

    /// Timeout for a single operation in seconds
    #[clap(long, default_value = "30")]
    timeout: u64,
}

#[derive(Parser, Debug)]
enum SubCommand {
    Create(commands::create::Create),
    Start(commands::start::Start),
    Kill(commands::kill::Kill),
    Delete(commands::delete::Delete),
    State(commands::state::State),
    List(commands::list::List),
}

fn main() {
    let opts = Opts::parse();
    if let Err(err) = run(opts) {
        tracing::error!(?err, "command failed");
        eprintln!("lxcri: {err:#}");
        std::process::exit(1);
    }
}

fn run(opts: Opts) -> anyhow::Result<()> {
    observability::init(&opts.global).context("failed to initialize logging")?;

    let mut runtime = Runtime::new(&opts.global.root, &opts.global.libexec_dir)
        .context("failed to construct runtime")?;
    runtime.monitor_cgroup = opts.global.monitor_cgroup.clone();
    runtime.init().context("runtime preflight failed")?;

    let ctx = Context::with_timeout(Duration::from_secs(opts.global.timeout));

    match opts.subcmd {
        SubCommand::Create(args) => commands::create::create(args, &runtime, &ctx, &opts.global),
        SubCommand::Start(args) => commands::start::start(args, &runtime, &ctx),
        SubCommand::Kill(args) => commands::kill::kill(args, &runtime, &ctx),
        SubCommand::Delete(args) => commands::delete::delete(args, &runtime, &ctx),
        SubCommand::State(args) => commands::state::state(args, &runtime),
        SubCommand::List(args) => commands::list::list(args, &runtime),
    }
}
