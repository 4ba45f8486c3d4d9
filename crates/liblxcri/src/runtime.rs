//! The runtime manager: process-wide configuration, host preflight and
//! the OCI lifecycle verbs.

use std::path::{Path, PathBuf};

use nix::sys::signal::Signal as NixSignal;
use nix::sys::statfs::{CGROUP2_SUPER_MAGIC, PROC_SUPER_MAGIC};
use nix::unistd::geteuid;

use crate::cgroup;
use crate::container::{Container, ContainerStatus};
use crate::context::Context;
use crate::engine::{self, Engine};
use crate::error::{Error, Precondition, Result};
use crate::signal::Signal;
use crate::utils;

/// Monitor binary, started per container. Keeps running for the
/// container's lifetime.
pub const EXEC_START: &str = "lxcri-start";
/// Engine-side hook binary creating devices and masking paths.
pub const EXEC_HOOK: &str = "lxcri-hook";
/// Container init binary that execs the user process.
pub const EXEC_INIT: &str = "lxcri-init";

/// Environment variables propagated to the monitor process.
const KEEP_ENV: [&str; 3] = ["HOME", "XDG_RUNTIME_DIR", "PATH"];

/// Security features applied to every container created by the runtime.
#[derive(Debug, Clone, Copy)]
pub struct Features {
    pub seccomp: bool,
    pub capabilities: bool,
    pub apparmor: bool,
    pub cgroup_devices: bool,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            seccomp: true,
            capabilities: true,
            apparmor: true,
            cgroup_devices: true,
        }
    }
}

/// Factory for creating and managing containers. Initialized once with
/// [`Runtime::init`], then treated as immutable.
pub struct Runtime {
    /// Parent directory of all container runtime directories.
    pub root: PathBuf,
    /// Directory holding the runtime executables (monitor, hook, init).
    pub libexec_dir: PathBuf,
    /// Cgroup (relative to the cgroup root) for monitor processes.
    pub monitor_cgroup: Option<String>,
    pub features: Features,
    /// Mount point of the unified cgroup hierarchy.
    pub cgroup_root: PathBuf,
    /// Whether the calling user is root; set by `init`.
    pub privileged: bool,
    /// Environment passed to the monitor; set by `init`.
    pub env: Vec<(String, String)>,

    engine: Box<dyn Engine>,
}

impl Runtime {
    /// A runtime using the default engine backend.
    pub fn new(root: impl Into<PathBuf>, libexec_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::with_engine(root, libexec_dir, engine::default_engine()?))
    }

    /// A runtime with an explicit engine, used by the test suite.
    pub fn with_engine(
        root: impl Into<PathBuf>,
        libexec_dir: impl Into<PathBuf>,
        engine: Box<dyn Engine>,
    ) -> Self {
        Runtime {
            root: root.into(),
            libexec_dir: libexec_dir.into(),
            monitor_cgroup: None,
            features: Features::default(),
            cgroup_root: PathBuf::from(cgroup::DEFAULT_CGROUP_ROOT),
            privileged: false,
            env: Vec::new(),
            engine,
        }
    }

    /// One-shot preflight: verifies the host and snapshots the caller's
    /// identity and environment. All checks run before anything is
    /// created, so a failing init leaves no state behind.
    pub fn init(&mut self) -> Result<()> {
        utils::can_execute(
            [EXEC_START, EXEC_HOOK, EXEC_INIT]
                .map(|name| self.libexec(name))
                .iter()
                .map(PathBuf::as_path),
        )
        .map_err(|reason| Error::precondition(Precondition::LibexecBinaries, reason))?;

        utils::is_filesystem(Path::new("/proc"), "proc", PROC_SUPER_MAGIC)
            .map_err(|reason| Error::precondition(Precondition::Procfs, reason))?;
        utils::is_filesystem(&self.cgroup_root, "cgroup2", CGROUP2_SUPER_MAGIC)
            .map_err(|reason| Error::precondition(Precondition::CgroupRoot, reason))?;

        let version = self.engine.version()?;
        if !version.at_least(engine::VERSION_FLOOR) {
            return Err(Error::precondition(
                Precondition::EngineVersion,
                format!(
                    "engine version is {version}, but >= {} is required",
                    engine::VERSION_FLOOR
                ),
            ));
        }
        if !version.at_least(engine::VERSION_RECOMMENDED) {
            tracing::warn!(
                %version,
                "engine version >= {} is recommended",
                engine::VERSION_RECOMMENDED
            );
        }

        let rootfs_mount = self.rootfs_mount();
        std::fs::create_dir_all(&rootfs_mount).map_err(|err| {
            Error::precondition(
                Precondition::RuntimeRoot,
                format!("failed to create {}: {err}", rootfs_mount.display()),
            )
        })?;
        // unprivileged id mappings must be able to traverse it
        chmod(&rootfs_mount, 0o777)?;

        self.privileged = geteuid().is_root();
        self.env = KEEP_ENV
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
            .collect();
        Ok(())
    }

    pub(crate) fn libexec(&self, name: &str) -> PathBuf {
        self.libexec_dir.join(name)
    }

    pub(crate) fn privileged(&self) -> bool {
        self.privileged
    }

    /// Shared directory the engine pivots container rootfs mounts
    /// through.
    pub(crate) fn rootfs_mount(&self) -> PathBuf {
        self.root.join(".rootfs")
    }

    pub(crate) fn cgroup_root(&self) -> &Path {
        &self.cgroup_root
    }

    pub(crate) fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    /// Loads a container created by this runtime from its runtime
    /// directory.
    pub fn load(&self, container_id: &str) -> Result<Container> {
        let dir = self.root.join(container_id);
        if !dir.is_dir() {
            return Err(Error::NotExist);
        }
        Container::load(dir, self.engine.as_ref())
    }

    /// Container ids present under the runtime root.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => {
                return Err(Error::system(
                    format!("failed to read {}", self.root.display()),
                    err,
                ))
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if entry.path().is_dir() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Unblocks the container init process. Returns only once the init
    /// has exec'ed into the user process (or the monitor died).
    pub fn start(&self, ctx: &Context, container: &mut Container) -> Result<()> {
        tracing::info!(id = container.id(), "notify init to start container process");
        let status = container.status()?;
        if !status.can_start() {
            return Err(Error::IllegalState {
                required: "created",
                actual: status,
            });
        }
        container.start(ctx)
    }

    /// Sends `signal` to every process in the container's cgroup.
    pub fn kill(&self, ctx: &Context, container: &mut Container, signal: Signal) -> Result<()> {
        let status = container.status()?;
        if !status.can_kill() {
            return Err(Error::IllegalState {
                required: "a container that is not stopped",
                actual: status,
            });
        }
        container.kill(ctx, self.cgroup_root(), signal)
    }

    /// Removes the container. Idempotent: deleting an unknown id cleans
    /// up any orphaned runtime directory and succeeds. A container that
    /// is not stopped requires `force`, which SIGKILLs the cgroup before
    /// draining it.
    pub fn delete(&self, ctx: &Context, container_id: &str, force: bool) -> Result<()> {
        tracing::info!(id = container_id, force, "delete container");
        let mut container = match self.load(container_id) {
            Ok(container) => container,
            Err(Error::NotExist) => {
                tracing::info!(id = container_id, "container does not exist");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(%err, "deleting runtime dir of unloadable container");
                let dir = self.root.join(container_id);
                return std::fs::remove_dir_all(&dir).map_err(|err| {
                    Error::system(format!("failed to remove {}", dir.display()), err)
                });
            }
        };

        let status = container.status()?;
        if status != ContainerStatus::Stopped {
            if !force {
                return Err(Error::IllegalState {
                    required: "stopped (or force)",
                    actual: status,
                });
            }
            container.kill(ctx, self.cgroup_root(), Signal::from(NixSignal::SIGKILL))?;
        }

        // Processes may escape the kill above, e.g. without an isolated
        // PID namespace. Every container owns its cgroup, so drain the
        // whole tree.
        if !container.config.cgroup_dir.as_os_str().is_empty() {
            let cgroup_dir = self.cgroup_root().join(&container.config.cgroup_dir);
            if let Err(err) = cgroup::drain(ctx, &cgroup_dir, Signal::from(NixSignal::SIGKILL)) {
                tracing::warn!(%err, "draining cgroup failed");
            } else {
                tracing::info!(id = container_id, "cgroup drained");
            }
        }

        container.destroy()?;
        container.release()
    }
}

pub(crate) fn chmod(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|err| Error::system(format!("failed to chmod {}", path.display()), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test::TestEngine;
    use crate::engine::EngineVersion;
    use anyhow::Result;

    fn runtime_with(engine: TestEngine, dir: &Path) -> Runtime {
        let mut rt = Runtime::with_engine(dir.join("run"), dir.join("libexec"), Box::new(engine));
        rt.cgroup_root = dir.join("cgroup");
        rt
    }

    fn write_fake_libexec(dir: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::create_dir_all(dir)?;
        for name in [EXEC_START, EXEC_HOOK, EXEC_INIT] {
            let path = dir.join(name);
            std::fs::write(&path, "#!/bin/sh\nexec /bin/sleep 30\n")?;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    #[test]
    fn test_init_rejects_missing_libexec() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut rt = runtime_with(TestEngine::new(), dir.path());
        match rt.init() {
            Err(Error::PreconditionFailed {
                kind: Precondition::LibexecBinaries,
                ..
            }) => Ok(()),
            other => anyhow::bail!("expected libexec precondition failure, got {other:?}"),
        }
    }

    #[test]
    fn test_init_rejects_old_engine() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = TestEngine::with_version(EngineVersion::new(3, 0, 0));
        let mut rt = runtime_with(engine, dir.path());
        write_fake_libexec(&rt.libexec_dir.clone())?;
        // the cgroup root check runs against a plain tempdir and fails
        // first unless pointed at the real mount
        rt.cgroup_root = PathBuf::from(cgroup::DEFAULT_CGROUP_ROOT);
        match rt.init() {
            Err(Error::PreconditionFailed { kind, .. }) => {
                assert!(matches!(
                    kind,
                    Precondition::EngineVersion | Precondition::CgroupRoot
                ));
                Ok(())
            }
            other => anyhow::bail!("expected precondition failure, got {other:?}"),
        }
    }

    #[test]
    fn test_load_unknown_container() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = runtime_with(TestEngine::new(), dir.path());
        assert!(matches!(rt.load("missing"), Err(Error::NotExist)));
        Ok(())
    }

    #[test]
    fn test_delete_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = runtime_with(TestEngine::new(), dir.path());
        let ctx = Context::background();

        // never-created id
        rt.delete(&ctx, "ghost", false)?;
        rt.delete(&ctx, "ghost", true)?;

        // an orphaned runtime directory without a loadable snapshot
        let orphan = rt.root.join("orphan");
        std::fs::create_dir_all(&orphan)?;
        std::fs::write(orphan.join("lxcri.json"), "not json")?;
        rt.delete(&ctx, "orphan", false)?;
        assert!(!orphan.exists());
        rt.delete(&ctx, "orphan", false)?;
        Ok(())
    }

    #[test]
    fn test_list_skips_files_and_hidden_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = runtime_with(TestEngine::new(), dir.path());
        std::fs::create_dir_all(rt.root.join("b1"))?;
        std::fs::create_dir_all(rt.root.join("a1"))?;
        std::fs::create_dir_all(rt.root.join(".rootfs"))?;
        std::fs::write(rt.root.join("stray-file"), "")?;

        assert_eq!(rt.list()?, vec!["a1".to_string(), "b1".to_string()]);
        Ok(())
    }
}
