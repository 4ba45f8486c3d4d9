//! Bundle helpers: loading the spec from an OCI bundle and building a
//! minimal spec for embedding and tests.

use std::path::Path;

use oci_spec::runtime::{
    LinuxBuilder, LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType, Mount, MountBuilder,
    ProcessBuilder, RootBuilder, Spec, SpecBuilder,
};

use crate::container::SPEC_FILE;
use crate::error::{Error, Result};

/// Reads the JSON encoded spec (`config.json`) from the given bundle
/// directory.
pub fn load_spec(bundle: &Path) -> Result<Spec> {
    let path = bundle.join(SPEC_FILE);
    Spec::load(&path)
        .map_err(|err| Error::system(format!("failed to load spec from {}", path.display()), err))
}

/// All namespaces isolated by default.
pub fn default_namespaces() -> Vec<LinuxNamespace> {
    [
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Mount,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
        LinuxNamespaceType::Cgroup,
        LinuxNamespaceType::Network,
    ]
    .into_iter()
    .map(|typ| {
        LinuxNamespaceBuilder::default()
            .typ(typ)
            .build()
            .expect("default namespace")
    })
    .collect()
}

fn default_mounts() -> Result<Vec<Mount>> {
    let invalid = |err| Error::invalid_config(format!("invalid default mount: {err}"));
    Ok(vec![
        MountBuilder::default()
            .destination("/proc")
            .source("proc")
            .typ("proc")
            .options(
                ["rw", "nosuid", "nodev", "noexec", "relatime"]
                    .map(String::from)
                    .to_vec(),
            )
            .build()
            .map_err(invalid)?,
        MountBuilder::default()
            .destination("/dev")
            .source("tmpfs")
            .typ("tmpfs")
            .options(
                ["rw", "nosuid", "noexec", "relatime", "mode=755"]
                    .map(String::from)
                    .to_vec(),
            )
            .build()
            .map_err(invalid)?,
    ])
}

/// A minimal spec that runs `args` within `rootfs`: default namespaces,
/// proc and a tmpfs /dev mounted. The rootfs must contain /proc and
/// /dev directories.
pub fn new_spec(rootfs: &Path, args: &[&str]) -> Result<Spec> {
    let invalid = |err| Error::invalid_config(format!("invalid spec: {err}"));
    SpecBuilder::default()
        .root(RootBuilder::default().path(rootfs).build().map_err(invalid)?)
        .process(
            ProcessBuilder::default()
                .args(args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>())
                .cwd("/")
                .build()
                .map_err(invalid)?,
        )
        .linux(
            LinuxBuilder::default()
                .namespaces(default_namespaces())
                .build()
                .map_err(invalid)?,
        )
        .mounts(default_mounts()?)
        .build()
        .map_err(invalid)
}
