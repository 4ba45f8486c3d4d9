//! Per-container state: the runtime directory, the engine handle, the
//! monitor PID and the create/start handshake over the sync FIFO.

mod state;

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};

pub use state::{derive_status, probe_init, ContainerStatus, InitProbe, OciState, State};
pub use state::INIT_SENTINEL;

use crate::cgroup;
use crate::context::Context;
use crate::engine::{Engine, EngineError, EngineHandle, EngineState};
use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::utils;

/// Engine-native configuration, saved from the handle.
pub const CONFIG_FILE: &str = "config";
/// OCI spec snapshot.
pub const SPEC_FILE: &str = "config.json";
/// Extracted OCI hooks block.
pub const HOOKS_FILE: &str = "hooks.json";
/// Initial OCI state, written during create.
pub const STATE_FILE: &str = "state.json";
/// Runtime snapshot of the [`Container`].
pub const RUNTIME_FILE: &str = "lxcri.json";
/// Named FIFO implementing the create/start barrier.
pub const SYNC_FIFO: &str = "syncfifo";

const CREATE_POLL: Duration = Duration::from_millis(100);
const START_POLL: Duration = Duration::from_millis(10);

/// Per-container request, owned by the caller until `create`.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ContainerConfig {
    /// Container identifier, unique per runtime root. Must match
    /// `[a-z][a-z0-9_-]+`.
    pub container_id: String,
    pub bundle_path: PathBuf,
    /// The decoded OCI spec. Changes after `create` have no effect.
    pub spec: Spec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_socket: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
    /// Whether `CgroupsPath` uses the systemd `slice:prefix:name`
    /// encoding.
    pub systemd_cgroup: bool,
    /// Cgroup directory of the monitor process, relative to the cgroup
    /// root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_cgroup_dir: Option<PathBuf>,
    /// Container cgroup directory relative to the cgroup root, computed
    /// during create.
    pub cgroup_dir: PathBuf,
    /// Engine log destination, defaults to `engine.log` in the runtime
    /// directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Authoritative per-instance state after `create`.
#[derive(Serialize, Deserialize, Debug)]
pub struct Container {
    #[serde(flatten)]
    pub config: ContainerConfig,

    pub created_at: DateTime<Utc>,
    /// PID of the monitor process (`lxcri-start`). Greater than 1 for any
    /// live container.
    pub monitor_pid: i32,

    #[serde(skip)]
    pub(crate) runtime_dir: PathBuf,
    #[serde(skip)]
    pub(crate) handle: Option<Box<dyn EngineHandle>>,
}

impl Container {
    pub(crate) fn new(config: ContainerConfig, runtime_dir: PathBuf) -> Self {
        Container {
            config,
            created_at: Utc::now(),
            monitor_pid: 0,
            runtime_dir,
            handle: None,
        }
    }

    /// Loads a container from its runtime directory and reconstructs the
    /// engine handle from the saved engine config.
    pub(crate) fn load(runtime_dir: PathBuf, engine: &dyn Engine) -> Result<Self> {
        let mut container: Container = utils::read_json_file(&runtime_dir.join(RUNTIME_FILE))?;
        container.runtime_dir = runtime_dir;

        let config_file = container.config_file_path();
        if !config_file.is_file() {
            return Err(Error::system(
                format!("missing engine config {}", config_file.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        let mut handle = engine.new_handle(
            &container.config.container_id,
            container.lxcpath(),
        )?;
        handle.load_config(&config_file)?;
        container.handle = Some(handle);
        Ok(container)
    }

    /// Persists the runtime snapshot (`lxcri.json`).
    pub(crate) fn save(&self) -> Result<()> {
        utils::create_json_file(&self.runtime_path(RUNTIME_FILE), self, 0o640)
    }

    pub fn id(&self) -> &str {
        &self.config.container_id
    }

    pub fn spec(&self) -> &Spec {
        &self.config.spec
    }

    /// Absolute path of `sub_path` within the container runtime
    /// directory.
    pub fn runtime_path(&self, sub_path: impl AsRef<Path>) -> PathBuf {
        self.runtime_dir.join(sub_path)
    }

    /// The engine's container parent directory (the runtime root).
    fn lxcpath(&self) -> &Path {
        self.runtime_dir.parent().unwrap_or(Path::new("/"))
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.runtime_path(CONFIG_FILE)
    }

    fn syncfifo_path(&self) -> PathBuf {
        self.runtime_path(SYNC_FIFO)
    }

    pub(crate) fn handle(&self) -> Result<&dyn EngineHandle> {
        self.handle
            .as_deref()
            .ok_or_else(|| Error::system("engine handle released", released_err()))
    }

    pub(crate) fn handle_mut(&mut self) -> Result<&mut Box<dyn EngineHandle>> {
        self.handle
            .as_mut()
            .ok_or_else(|| Error::system("engine handle released", released_err()))
    }

    pub fn engine_state(&self) -> Result<EngineState> {
        Ok(self.handle()?.state()?)
    }

    /// Computes the current OCI status from the engine state and the init
    /// process probe.
    pub fn status(&self) -> Result<ContainerStatus> {
        let handle = self.handle()?;
        let engine_state = handle.state()?;
        Ok(derive_status(engine_state, probe_init(handle.init_pid())))
    }

    /// The full runtime state view: engine state, runtime directory and
    /// the OCI state document.
    pub fn state(&self) -> Result<State> {
        let status = self.status()?;
        let spec = &self.config.spec;
        Ok(State {
            engine_state: self.engine_state()?,
            runtime_dir: self.runtime_dir.clone(),
            oci: OciState {
                oci_version: spec.version().clone(),
                id: self.config.container_id.clone(),
                status,
                pid: (self.monitor_pid > 1).then_some(self.monitor_pid),
                bundle: self.runtime_dir.clone(),
                annotations: spec.annotations().clone(),
            },
        })
    }

    /// Whether the monitor process is still alive. Uses `waitpid` with
    /// WNOHANG; falls back to `kill(pid, 0)` when the monitor is not a
    /// child of this process.
    pub fn is_monitor_running(&self) -> bool {
        if self.monitor_pid < 2 {
            return false;
        }
        let pid = Pid::from_raw(self.monitor_pid);
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                tracing::info!(pid = self.monitor_pid, ?status, "monitor died");
                false
            }
            Err(nix::errno::Errno::ECHILD) => match signal::kill(pid, None) {
                Ok(()) => true,
                Err(nix::errno::Errno::ESRCH) => false,
                Err(err) => {
                    tracing::warn!(pid = self.monitor_pid, %err, "monitor liveness check failed");
                    false
                }
            },
            Err(_) => false,
        }
    }

    /// Blocks until the engine reports RUNNING and the init process still
    /// sits on the sentinel, i.e. the container reached `created`.
    pub(crate) fn wait_created(&self, ctx: &Context) -> Result<()> {
        loop {
            ctx.check("create rendezvous")?;
            if !self.is_monitor_running() {
                return Err(EngineError::MonitorDied.into());
            }
            let handle = self.handle()?;
            let engine_state = handle.state()?;
            if engine_state != EngineState::Running {
                tracing::debug!(%engine_state, "waiting for engine state RUNNING");
                std::thread::sleep(CREATE_POLL);
                continue;
            }
            return match probe_init(handle.init_pid()) {
                InitProbe::Sentinel => Ok(()),
                probe => Err(Error::system(
                    "unexpected init process state after engine start",
                    format!("probe: {probe:?}"),
                )),
            };
        }
    }

    /// Blocks until the init process exec'ed away from the sentinel or
    /// the monitor died.
    fn wait_started(&self, ctx: &Context) -> Result<()> {
        loop {
            ctx.check("start")?;
            if !self.is_monitor_running() {
                return Ok(());
            }
            if probe_init(self.handle()?.init_pid()) != InitProbe::Sentinel {
                return Ok(());
            }
            std::thread::sleep(START_POLL);
        }
    }

    /// Unblocks the init process: opens the sync FIFO for writing and
    /// closes it again. The open succeeds only once the init holds the
    /// read side; the close delivers the EOF that tells it to exec.
    pub(crate) fn start(&self, ctx: &Context) -> Result<()> {
        let fifo = self.syncfifo_path();
        loop {
            ctx.check("sync fifo open")?;
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&fifo)
            {
                Ok(file) => {
                    drop(file);
                    break;
                }
                // no reader yet
                Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                    std::thread::sleep(START_POLL)
                }
                Err(err) => {
                    return Err(Error::system(
                        format!("failed to open sync fifo {}", fifo.display()),
                        err,
                    ))
                }
            }
        }
        self.wait_started(ctx)
    }

    /// Delivers `signal` to every process in the container's cgroup.
    pub(crate) fn kill(&self, ctx: &Context, cgroup_root: &Path, signal: Signal) -> Result<()> {
        tracing::info!(
            id = self.id(),
            signal = %signal.as_raw(),
            "killing container processes"
        );
        let dir = cgroup_root.join(&self.config.cgroup_dir);
        cgroup::kill_all(ctx, &dir, signal)
    }

    /// Removes engine resources and the runtime directory.
    pub(crate) fn destroy(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            if let Err(err) = handle.destroy() {
                tracing::warn!(%err, "engine destroy failed");
            }
        }
        if self.runtime_dir.exists() {
            std::fs::remove_dir_all(&self.runtime_dir).map_err(|err| {
                Error::system(
                    format!("failed to remove {}", self.runtime_dir.display()),
                    err,
                )
            })?;
        }
        Ok(())
    }

    /// Releases the engine handle. Further state queries fail until the
    /// container is loaded again.
    pub fn release(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            tracing::debug!(id = self.id(), "releasing engine handle");
            handle.release()?;
        }
        Ok(())
    }
}

fn released_err() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "handle is gone")
}
