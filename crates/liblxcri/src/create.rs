//! Container creation: validate, materialize, translate, launch the
//! monitor and rendezvous with the created container.

use std::fs::OpenOptions;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use chrono::Utc;
use oci_spec::runtime::{LinuxNamespaceType, Spec};

use crate::container::{
    Container, ContainerConfig, ContainerStatus, OciState, CONFIG_FILE, HOOKS_FILE, SPEC_FILE,
    STATE_FILE,
};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::hooks;
use crate::monitor;
use crate::runtime::{chmod, Runtime};
use crate::translate;
use crate::utils;

/// OCI annotation carrying the engine config file path, so external
/// collaborators (hook scripts) can locate it.
pub const CONFIG_FILE_ANNOTATION: &str = "org.lxcri.ConfigFile";

/// A failed create.
///
/// Once the runtime directory has been claimed, the partially
/// constructed [`Container`] is handed back alongside the error so the
/// caller can recover the id and clean up with
/// `delete(id, force: true)`. Failures before that point (validation,
/// an id that is already taken) carry no container.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct CreateError {
    pub container: Option<Container>,
    #[source]
    pub error: Error,
}

impl CreateError {
    fn early(error: Error) -> Self {
        CreateError {
            container: None,
            error,
        }
    }

    /// The id of the container the failed create was asked to build, if
    /// anything was materialized for it.
    pub fn container_id(&self) -> Option<&str> {
        self.container.as_ref().map(Container::id)
    }
}

impl Runtime {
    /// Creates a container from the given configuration. This is the
    /// first lifecycle call; it returns once the monitor is up and the
    /// init process sleeps on the sync FIFO (`state >= created`), or
    /// with a hard error. On failure the [`CreateError`] carries the
    /// partially-constructed container (when one was materialized) so
    /// the caller can invoke `delete(id, force: true)` for cleanup.
    pub fn create(
        &self,
        ctx: &Context,
        mut config: ContainerConfig,
    ) -> std::result::Result<Container, CreateError> {
        if let Err(error) = self.check_config(&mut config) {
            return Err(CreateError::early(error));
        }

        let rundir = self.root.join(&config.container_id);
        if rundir.exists() {
            return Err(CreateError::early(Error::invalid_config(format!(
                "container {:?} already exists",
                config.container_id
            ))));
        }

        let mut container = Container::new(config, rundir);
        match self.materialize(ctx, &mut container) {
            Ok(()) => Ok(container),
            Err(error) => Err(CreateError {
                container: Some(container),
                error,
            }),
        }
    }

    fn materialize(&self, ctx: &Context, container: &mut Container) -> Result<()> {
        let rundir = container.runtime_dir.clone();
        // 0777 so unprivileged id mappings can traverse into it
        std::fs::create_dir_all(&rundir)
            .map_err(|err| Error::system(format!("failed to create {}", rundir.display()), err))?;
        chmod(&rundir, 0o777)?;

        // the engine config file; written for real after translation
        let config_file = rundir.join(CONFIG_FILE);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o640)
            .open(&config_file)
            .map_err(|err| {
                Error::system(format!("failed to create {}", config_file.display()), err)
            })?;

        let mut handle = self
            .engine()
            .new_handle(&container.config.container_id, &self.root)?;

        annotate(&mut container.config.spec, &config_file);

        // CreateRuntime hook failures do not abort create; the hooks run
        // against the "creating" state
        if let Some(create_runtime) = container
            .spec()
            .hooks()
            .as_ref()
            .and_then(|hooks| hooks.create_runtime().as_ref())
        {
            let state = initial_state(container);
            if let Err(err) = hooks::run_hooks(create_runtime, &state) {
                tracing::error!(%err, "failed to run CreateRuntime hooks");
            }
        }

        let items = translate::configure(self, &mut container.config, &rundir)?;
        items.apply(handle.as_mut())?;

        utils::create_json_file(&rundir.join(SPEC_FILE), container.spec(), 0o440)?;
        utils::create_json_file(&rundir.join(HOOKS_FILE), container.spec().hooks(), 0o440)?;
        utils::create_json_file(&rundir.join(STATE_FILE), &initial_state(container), 0o440)?;

        handle.save_config(&config_file)?;
        container.handle = Some(handle);

        tracing::debug!(id = container.id(), "starting monitor process");
        container.monitor_pid = monitor::start_monitor(self, ctx, container)?;

        tracing::debug!("waiting for init");
        container.wait_created(ctx)?;
        container.created_at = Utc::now();
        tracing::info!(
            pid = container.monitor_pid,
            "init process is running, container is created"
        );

        if let Some(pid_file) = container.config.pid_file.clone() {
            utils::write_pid_file(&pid_file, container.monitor_pid)?;
        }

        container.save()
    }

    fn check_config(&self, config: &mut ContainerConfig) -> Result<()> {
        check_container_id(&config.container_id)?;
        self.check_spec(&mut config.spec)
    }

    fn check_spec(&self, spec: &mut Spec) -> Result<()> {
        if spec
            .root()
            .as_ref()
            .map_or(true, |root| root.path().as_os_str().is_empty())
        {
            return Err(Error::invalid_config("spec has no root path"));
        }
        let Some(process) = spec.process() else {
            return Err(Error::invalid_config("spec has no process"));
        };
        if process.args().as_ref().map_or(true, |args| args.is_empty()) {
            return Err(Error::invalid_config("spec process has no args"));
        }
        if process.cwd().as_os_str().is_empty() {
            tracing::info!("process cwd is unset, defaulting to '/'");
            let mut process = process.clone();
            process.set_cwd("/".into());
            spec.set_process(Some(process));
        }

        if shares_host_namespace(spec, LinuxNamespaceType::Mount)? {
            return Err(Error::invalid_config(
                "container wants to share the host's mount namespace",
            ));
        }
        // sharing the host PID namespace is discouraged but used in the
        // wild (e.g. systemd log collectors)
        if shares_host_namespace(spec, LinuxNamespaceType::Pid)? {
            tracing::info!("container will share the host's PID namespace");
        }
        Ok(())
    }
}

fn check_container_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::invalid_config("missing container ID"));
    }
    let mut chars = id.chars();
    let valid_first = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_rest = chars.clone().count() >= 1
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !(valid_first && valid_rest) {
        return Err(Error::invalid_config(format!(
            "container ID {id:?} does not match [a-z][a-z0-9_-]+"
        )));
    }
    Ok(())
}

fn annotate(spec: &mut Spec, config_file: &Path) {
    let mut annotations = spec.annotations().clone().unwrap_or_default();
    annotations.insert(
        CONFIG_FILE_ANNOTATION.to_string(),
        config_file.display().to_string(),
    );
    spec.set_annotations(Some(annotations));
}

fn initial_state(container: &Container) -> OciState {
    OciState {
        oci_version: container.spec().version().clone(),
        id: container.id().to_string(),
        status: ContainerStatus::Creating,
        pid: None,
        bundle: container.runtime_dir.clone(),
        annotations: container.spec().annotations().clone(),
    }
}

/// Whether the spec leaves the given namespace shared with the host:
/// either the namespace is not requested at all, or its path points at
/// the host's own namespace.
fn shares_host_namespace(spec: &Spec, typ: LinuxNamespaceType) -> Result<bool> {
    let Some(ns) = translate::namespace(spec, typ) else {
        return Ok(true);
    };
    let Some(path) = ns.path().as_ref().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(false);
    };

    let host_path = format!("/proc/self/ns/{}", translate::namespace_name(typ));
    let host = std::fs::metadata(&host_path)
        .map_err(|err| Error::system(format!("failed to stat {host_path}"), err))?;
    let target = std::fs::metadata(path)
        .map_err(|err| Error::system(format!("failed to stat {}", path.display()), err))?;
    Ok(host.dev() == target.dev() && host.ino() == target.ino())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use oci_spec::runtime::{
        LinuxBuilder, LinuxNamespace, LinuxNamespaceBuilder, ProcessBuilder, RootBuilder,
        SpecBuilder,
    };

    fn spec_with_namespaces(namespaces: Vec<LinuxNamespace>) -> Result<Spec> {
        Ok(SpecBuilder::default()
            .root(RootBuilder::default().path("/srv/rootfs").build()?)
            .process(
                ProcessBuilder::default()
                    .args(vec!["/sleep".to_string(), "3".to_string()])
                    .cwd("/")
                    .build()?,
            )
            .linux(LinuxBuilder::default().namespaces(namespaces).build()?)
            .build()?)
    }

    fn default_namespaces() -> Result<Vec<LinuxNamespace>> {
        [
            LinuxNamespaceType::Pid,
            LinuxNamespaceType::Mount,
            LinuxNamespaceType::Ipc,
            LinuxNamespaceType::Uts,
            LinuxNamespaceType::Network,
        ]
        .into_iter()
        .map(|typ| {
            LinuxNamespaceBuilder::default()
                .typ(typ)
                .build()
                .map_err(Into::into)
        })
        .collect()
    }

    #[test]
    fn test_container_id_pattern() {
        assert!(check_container_id("c1").is_ok());
        assert!(check_container_id("web-server_01").is_ok());

        assert!(check_container_id("").is_err());
        assert!(check_container_id("c").is_err());
        assert!(check_container_id("1c").is_err());
        assert!(check_container_id("C1").is_err());
        assert!(check_container_id("c 1").is_err());
        assert!(check_container_id("-c1").is_err());
    }

    // A spec without a mount namespace shares the host's and is rejected.
    #[test]
    fn test_empty_namespaces_rejected() -> Result<()> {
        let mut spec = spec_with_namespaces(vec![])?;
        let rt = test_runtime();
        match rt.check_spec(&mut spec) {
            Err(Error::InvalidConfig(msg)) => {
                assert!(msg.contains("mount namespace"));
                Ok(())
            }
            other => anyhow::bail!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_host_mount_namespace_path_rejected() -> Result<()> {
        let mut namespaces = default_namespaces()?;
        namespaces.retain(|ns| ns.typ() != LinuxNamespaceType::Mount);
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Mount)
                .path(format!("/proc/{}/ns/mnt", std::process::id()))
                .build()?,
        );
        let mut spec = spec_with_namespaces(namespaces)?;
        assert!(matches!(
            test_runtime().check_spec(&mut spec),
            Err(Error::InvalidConfig(_))
        ));
        Ok(())
    }

    // Sharing the host PID namespace is allowed (with an info log).
    #[test]
    fn test_host_pid_namespace_path_allowed() -> Result<()> {
        let mut namespaces = default_namespaces()?;
        namespaces.retain(|ns| ns.typ() != LinuxNamespaceType::Pid);
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Pid)
                .path(format!("/proc/{}/ns/pid", std::process::id()))
                .build()?,
        );
        let mut spec = spec_with_namespaces(namespaces)?;
        test_runtime().check_spec(&mut spec)?;
        Ok(())
    }

    #[test]
    fn test_missing_pieces_rejected() -> Result<()> {
        let rt = test_runtime();

        let mut spec = spec_with_namespaces(default_namespaces()?)?;
        spec.set_root(None);
        assert!(rt.check_spec(&mut spec).is_err());

        let mut spec = spec_with_namespaces(default_namespaces()?)?;
        spec.set_process(None);
        assert!(rt.check_spec(&mut spec).is_err());

        let mut spec = spec_with_namespaces(default_namespaces()?)?;
        let process = ProcessBuilder::default().cwd("/").build()?;
        spec.set_process(Some(process));
        assert!(rt.check_spec(&mut spec).is_err());
        Ok(())
    }

    #[test]
    fn test_empty_cwd_defaults_to_root() -> Result<()> {
        let mut spec = spec_with_namespaces(default_namespaces()?)?;
        let process = ProcessBuilder::default()
            .args(vec!["/sleep".to_string()])
            .cwd("")
            .build()?;
        spec.set_process(Some(process));

        test_runtime().check_spec(&mut spec)?;
        assert_eq!(
            spec.process().as_ref().unwrap().cwd(),
            Path::new("/")
        );
        Ok(())
    }

    fn test_runtime() -> Runtime {
        Runtime::with_engine(
            "/tmp/lxcri-test-root",
            "/tmp/lxcri-test-libexec",
            Box::new(crate::engine::test::TestEngine::new()),
        )
    }
}
