//! Cgroup path resolution, resource limits and process reaping on the
//! unified (v2) hierarchy.
//!
//! The runtime creates the container cgroup before the engine starts and
//! drains it on delete: every container gets its own cgroup, so killing
//! the whole tree also reaches processes that escaped the init's PID
//! namespace (or share the host's).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal;
use nix::unistd::Pid;
use oci_spec::runtime::{LinuxDeviceCgroup, LinuxDeviceType, LinuxResources};

use crate::context::Context;
use crate::engine::{EngineConfig, EngineError};
use crate::error::{Error, Result};
use crate::signal::Signal;

/// Mount point of the unified hierarchy.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

const CGROUP_PROCS: &str = "cgroup.procs";
const CGROUP_KILL: &str = "cgroup.kill";
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Resolves the spec's `CgroupsPath` to a directory relative to the
/// cgroup root.
///
/// With the systemd encoding, `a.slice:prefix:name` expands to
/// `a.slice/prefix-name.scope`, where multi-component slices grow one
/// directory per `-` separated component (`a-b.slice` becomes
/// `a.slice/a-b.slice`). Without it the path is taken verbatim. An unset
/// path defaults to `lxcri/<container-id>`.
pub fn resolve_cgroup_dir(
    cgroups_path: Option<&Path>,
    systemd: bool,
    container_id: &str,
) -> Result<PathBuf> {
    let Some(path) = cgroups_path.filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(PathBuf::from("lxcri").join(container_id));
    };

    if !systemd {
        return Ok(path
            .to_str()
            .map(|p| PathBuf::from(p.trim_start_matches('/')))
            .unwrap_or_else(|| path.to_path_buf()));
    }

    let encoded = path
        .to_str()
        .ok_or_else(|| Error::invalid_config(format!("invalid cgroups path {path:?}")))?;
    let parts: Vec<&str> = encoded.split(':').collect();
    let [slice, prefix, name] = parts[..] else {
        return Err(Error::invalid_config(format!(
            "systemd cgroups path must be slice:prefix:name, got {encoded:?}"
        )));
    };

    let mut dir = expand_slice(slice)?;
    if name.ends_with(".slice") {
        dir.push(name);
    } else if prefix.is_empty() {
        dir.push(format!("{name}.scope"));
    } else {
        dir.push(format!("{prefix}-{name}.scope"));
    }
    Ok(dir)
}

/// Expands a systemd slice name into its directory chain:
/// `test-a-b.slice` becomes `test.slice/test-a.slice/test-a-b.slice`.
fn expand_slice(slice: &str) -> Result<PathBuf> {
    let suffix = ".slice";
    if !slice.ends_with(suffix) || slice.len() == suffix.len() || slice.contains('/') {
        return Err(Error::invalid_config(format!("invalid slice name {slice:?}")));
    }
    let name = slice.trim_end_matches(suffix);
    if name == "-" {
        return Ok(PathBuf::new());
    }

    let mut dir = PathBuf::new();
    let mut prefix = String::new();
    for component in name.split('-') {
        if component.is_empty() {
            return Err(Error::invalid_config(format!("invalid slice name {slice:?}")));
        }
        dir.push(format!("{prefix}{component}{suffix}"));
        prefix = format!("{prefix}{component}-");
    }
    Ok(dir)
}

/// Creates the container cgroup. The directory must not contain any
/// process; a busy cgroup means the path is already claimed by a live
/// container.
pub fn create_cgroup(cgroup_root: &Path, dir: &Path) -> Result<PathBuf> {
    let full = cgroup_root.join(dir);
    if full.is_dir() {
        let procs = read_procs(&full)?;
        if !procs.is_empty() {
            return Err(EngineError::CgroupNotEmpty { path: full }.into());
        }
    }
    std::fs::create_dir_all(&full)
        .map_err(|err| Error::system(format!("failed to create cgroup {}", full.display()), err))?;
    Ok(full)
}

/// PIDs currently in the cgroup directory (not the subtree). A missing
/// cgroup reads as empty.
pub fn read_procs(dir: &Path) -> Result<Vec<Pid>> {
    let procs = dir.join(CGROUP_PROCS);
    let content = match std::fs::read_to_string(&procs) {
        Ok(content) => content,
        Err(err) if ignorable(&err) => return Ok(Vec::new()),
        Err(err) => {
            return Err(Error::system(
                format!("failed to read {}", procs.display()),
                err,
            ))
        }
    };
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .map(Pid::from_raw)
        .collect())
}

/// All PIDs in the cgroup subtree, children before parents.
fn read_procs_recursive(dir: &Path) -> Result<Vec<Pid>> {
    let mut pids = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if ignorable(&err) => return Ok(pids),
        Err(err) => {
            return Err(Error::system(
                format!("failed to read cgroup {}", dir.display()),
                err,
            ))
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            pids.extend(read_procs_recursive(&path)?);
        }
    }
    pids.extend(read_procs(dir)?);
    Ok(pids)
}

/// Sends `signal` to every process in the cgroup subtree.
///
/// SIGKILL uses the kernel's `cgroup.kill` when present, which kills the
/// whole subtree atomically. Any other signal (and kernels without
/// `cgroup.kill`) walks `cgroup.procs` post-order and signals each PID.
/// A vanishing cgroup (ENOENT/ENODEV) counts as success since the engine
/// may remove it concurrently.
pub fn kill_all(ctx: &Context, dir: &Path, sig: Signal) -> Result<()> {
    ctx.check("cgroup kill")?;
    if sig.as_raw() == signal::Signal::SIGKILL {
        let kill_file = dir.join(CGROUP_KILL);
        match std::fs::write(&kill_file, "1") {
            Ok(()) => return Ok(()),
            Err(err) if ignorable(&err) => {
                // fall through to the per-process walk on kernels without
                // cgroup.kill; a missing cgroup directory resolves to an
                // empty walk
            }
            Err(err) => {
                return Err(Error::system(
                    format!("failed to write {}", kill_file.display()),
                    err,
                ))
            }
        }
    }

    for pid in read_procs_recursive(dir)? {
        match signal::kill(pid, sig.as_raw()) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => {
                return Err(Error::system(
                    format!("failed to signal pid {pid}"),
                    std::io::Error::from(err),
                ))
            }
        }
    }
    Ok(())
}

/// Drains the cgroup: keeps signalling the subtree until no process is
/// left or the context expires.
pub fn drain(ctx: &Context, dir: &Path, sig: Signal) -> Result<()> {
    loop {
        ctx.check("cgroup drain")?;
        kill_all(ctx, dir, sig)?;
        if read_procs_recursive(dir)?.is_empty() {
            return Ok(());
        }
        std::thread::sleep(DRAIN_POLL);
    }
}

fn ignorable(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::NotFound || err.raw_os_error() == Some(libc::ENODEV)
}

/// Translates the spec's resource limits into `lxc.cgroup2.*` config
/// items.
pub fn resources_to_items(
    config: &mut EngineConfig,
    resources: &LinuxResources,
    cgroup_devices: bool,
) {
    if let Some(memory) = resources.memory() {
        if let Some(limit) = memory.limit() {
            config.set("lxc.cgroup2.memory.max", max_or(limit));
            if let Some(swap) = memory.swap() {
                // the spec value includes memory; the v2 file wants swap only
                config.set("lxc.cgroup2.memory.swap.max", max_or(swap.saturating_sub(limit)));
            }
        }
        if let Some(reservation) = memory.reservation() {
            config.set("lxc.cgroup2.memory.low", max_or(reservation));
        }
    }

    if let Some(cpu) = resources.cpu() {
        if let Some(shares) = cpu.shares() {
            if shares != 0 {
                config.set("lxc.cgroup2.cpu.weight", shares_to_weight(shares).to_string());
            }
        }
        let period = cpu.period().unwrap_or(100_000);
        if let Some(quota) = cpu.quota() {
            let quota = if quota > 0 {
                quota.to_string()
            } else {
                "max".to_string()
            };
            config.set("lxc.cgroup2.cpu.max", format!("{quota} {period}"));
        }
        if let Some(cpus) = cpu.cpus() {
            if !cpus.is_empty() {
                config.set("lxc.cgroup2.cpuset.cpus", cpus.clone());
            }
        }
        if let Some(mems) = cpu.mems() {
            if !mems.is_empty() {
                config.set("lxc.cgroup2.cpuset.mems", mems.clone());
            }
        }
    }

    if let Some(pids) = resources.pids() {
        config.set("lxc.cgroup2.pids.max", max_or(pids.limit()));
    }

    if let Some(block_io) = resources.block_io() {
        if let Some(weight) = block_io.weight() {
            if weight != 0 {
                config.set("lxc.cgroup2.io.weight", weight.to_string());
            }
        }
    }

    if let Some(hugepage_limits) = resources.hugepage_limits() {
        for limit in hugepage_limits {
            config.set(
                format!("lxc.cgroup2.hugetlb.{}.max", limit.page_size()),
                limit.limit().to_string(),
            );
        }
    }

    if cgroup_devices {
        if let Some(devices) = resources.devices() {
            for device in devices {
                let key = if device.allow() {
                    "lxc.cgroup2.devices.allow"
                } else {
                    "lxc.cgroup2.devices.deny"
                };
                config.set(key, device_rule(device));
            }
        }
    }

    if let Some(unified) = resources.unified() {
        for (file, value) in unified {
            config.set(format!("lxc.cgroup2.{file}"), value.clone());
        }
    }
}

fn max_or(value: i64) -> String {
    if value < 0 {
        "max".to_string()
    } else {
        value.to_string()
    }
}

/// Converts v1 cpu shares [2..262144] to a v2 weight [1..10000].
fn shares_to_weight(shares: u64) -> u64 {
    1 + ((shares.saturating_sub(2)) * 9999) / 262142
}

fn device_rule(device: &LinuxDeviceCgroup) -> String {
    let typ = match device.typ().unwrap_or(LinuxDeviceType::A) {
        LinuxDeviceType::B => "b",
        LinuxDeviceType::C | LinuxDeviceType::U => "c",
        LinuxDeviceType::P => "p",
        LinuxDeviceType::A => "a",
    };
    let major = device
        .major()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "*".to_string());
    let minor = device
        .minor()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "*".to_string());
    let access = device.access().clone().unwrap_or_else(|| "rwm".to_string());
    format!("{typ} {major}:{minor} {access}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use oci_spec::runtime::{
        LinuxCpuBuilder, LinuxDeviceCgroupBuilder, LinuxMemoryBuilder, LinuxPidsBuilder,
        LinuxResourcesBuilder,
    };

    #[test]
    fn test_resolve_raw_path() -> Result<()> {
        let dir = resolve_cgroup_dir(Some(Path::new("/kubepods/pod1/c1")), false, "c1")?;
        assert_eq!(dir, PathBuf::from("kubepods/pod1/c1"));

        let dir = resolve_cgroup_dir(None, false, "c1")?;
        assert_eq!(dir, PathBuf::from("lxcri/c1"));
        Ok(())
    }

    #[test]
    fn test_resolve_systemd_path() -> Result<()> {
        let dir = resolve_cgroup_dir(Some(Path::new("a.slice:crio:c1")), true, "c1")?;
        assert_eq!(dir, PathBuf::from("a.slice/crio-c1.scope"));

        let dir = resolve_cgroup_dir(Some(Path::new("test-a-b.slice:prefix:name")), true, "c1")?;
        assert_eq!(
            dir,
            PathBuf::from("test.slice/test-a.slice/test-a-b.slice/prefix-name.scope")
        );

        assert!(resolve_cgroup_dir(Some(Path::new("nodots:prefix:name")), true, "c1").is_err());
        assert!(resolve_cgroup_dir(Some(Path::new("not-encoded")), true, "c1").is_err());
        Ok(())
    }

    #[test]
    fn test_create_cgroup_rejects_busy() -> Result<()> {
        let root = tempfile::tempdir()?;
        let dir = Path::new("c1.slice");

        let full = create_cgroup(root.path(), dir)?;
        assert!(full.is_dir());

        // an empty existing cgroup is fine (cgroup.procs missing reads empty)
        create_cgroup(root.path(), dir)?;

        // a populated one is claimed by somebody else
        std::fs::write(full.join("cgroup.procs"), "123\n")?;
        match create_cgroup(root.path(), dir) {
            Err(Error::Engine(EngineError::CgroupNotEmpty { .. })) => {}
            other => panic!("expected CgroupNotEmpty, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_read_procs_subtree_order() -> Result<()> {
        let root = tempfile::tempdir()?;
        let parent = root.path().join("parent");
        let child = parent.join("child");
        std::fs::create_dir_all(&child)?;
        std::fs::write(parent.join("cgroup.procs"), "1000\n")?;
        std::fs::write(child.join("cgroup.procs"), "2000\n2001\n")?;

        let pids = read_procs_recursive(&parent)?;
        assert_eq!(
            pids,
            vec![Pid::from_raw(2000), Pid::from_raw(2001), Pid::from_raw(1000)]
        );
        Ok(())
    }

    #[test]
    fn test_kill_and_drain_tolerate_missing_cgroup() -> Result<()> {
        let ctx = Context::background();
        let gone = Path::new("/nonexistent/cgroup/dir");
        let sig = Signal::from(signal::Signal::SIGKILL);
        kill_all(&ctx, gone, sig)?;
        drain(&ctx, gone, sig)?;
        Ok(())
    }

    #[test]
    fn test_resources_to_items() -> Result<()> {
        let resources = LinuxResourcesBuilder::default()
            .memory(LinuxMemoryBuilder::default().limit(536870912i64).build()?)
            .cpu(
                LinuxCpuBuilder::default()
                    .shares(1024u64)
                    .quota(50000i64)
                    .period(100000u64)
                    .build()?,
            )
            .pids(LinuxPidsBuilder::default().limit(100i64).build()?)
            .devices(vec![LinuxDeviceCgroupBuilder::default()
                .allow(true)
                .typ(oci_spec::runtime::LinuxDeviceType::C)
                .major(1i64)
                .minor(3i64)
                .access("rwm")
                .build()?])
            .build()?;

        let mut config = EngineConfig::default();
        resources_to_items(&mut config, &resources, true);

        assert_eq!(config.get("lxc.cgroup2.memory.max"), Some("536870912"));
        assert_eq!(config.get("lxc.cgroup2.cpu.max"), Some("50000 100000"));
        assert_eq!(config.get("lxc.cgroup2.pids.max"), Some("100"));
        assert_eq!(
            config.get("lxc.cgroup2.devices.allow"),
            Some("c 1:3 rwm")
        );
        // 1024 shares is the default and maps to ~weight 40
        assert_eq!(config.get("lxc.cgroup2.cpu.weight"), Some("39"));

        let mut without_devices = EngineConfig::default();
        resources_to_items(&mut without_devices, &resources, false);
        assert_eq!(without_devices.get("lxc.cgroup2.devices.allow"), None);
        Ok(())
    }

    #[test]
    fn test_shares_to_weight_bounds() {
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(262144), 10000);
    }
}
