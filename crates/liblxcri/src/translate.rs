//! Translates the OCI spec into the engine configuration record and the
//! side files consumed by the engine hook and the init process.
//!
//! Every produced item must be accepted by the engine; any failure here
//! aborts create.

use std::io::Write;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, sethostname};
use oci_spec::runtime::{
    Capability, LinuxNamespace, LinuxNamespaceType, PosixRlimitType, Spec,
};

use crate::cgroup;
use crate::container::{ContainerConfig, SYNC_FIFO};
use crate::devices;
use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::seccomp;

/// Seccomp profile in the engine's native format.
pub const SECCOMP_PROFILE_FILE: &str = "seccomp.conf";
/// Devices the hook creates with mknod.
pub const DEVICES_FILE: &str = "devices.txt";
/// Paths the hook masks with a bind-over.
pub const MASKED_FILE: &str = "masked.txt";
/// Mount point of the runtime directory inside the container.
const INIT_DIR: &str = "/.lxcri";

/// Produces the ordered engine configuration for the container and
/// writes the side files into the runtime directory. Mutates the spec
/// where policy requires it (default devices, device bind mounts, the
/// automatic user namespace).
pub(crate) fn configure(
    rt: &Runtime,
    config: &mut ContainerConfig,
    rundir: &Path,
) -> Result<EngineConfig> {
    let mut items = EngineConfig::default();

    configure_hostname(&mut items, &config.spec)?;
    configure_rootfs(rt, &mut items, &config.spec)?;
    configure_init(rt, &mut items, &config.spec, rundir)?;

    if !rt.privileged() && !has_namespace(&config.spec, LinuxNamespaceType::User) {
        tracing::warn!("unprivileged runtime - enabling user namespace");
        add_user_namespace(&mut config.spec)?;
    }
    configure_namespaces(&mut items, &config.spec)?;
    configure_id_mappings(&mut items, &config.spec);

    let spec = &config.spec;
    if let Some(process) = spec.process() {
        if let Some(oom_score_adj) = process.oom_score_adj() {
            items.set("lxc.proc.oom_score_adj", oom_score_adj.to_string());
        }
        if process.no_new_privileges().unwrap_or(false) {
            items.set("lxc.no_new_privs", "1");
        }
    }

    if rt.features.apparmor {
        configure_apparmor(&mut items, spec);
    } else {
        tracing::warn!("apparmor feature is disabled - no profile will be configured");
    }

    if rt.features.seccomp {
        configure_seccomp(&mut items, spec, rundir)?;
    } else {
        tracing::warn!("seccomp feature is disabled - all system calls are allowed");
    }

    if rt.features.capabilities {
        configure_capabilities(&mut items, spec);
    } else {
        tracing::warn!("capabilities feature is disabled - running with full privileges");
    }

    // the engine must not populate /dev on its own
    items.set("lxc.autodev", "0");
    devices::ensure_default_devices(&mut config.spec)?;
    if devices::can_mknod() {
        devices::write_devices_file(&rundir.join(DEVICES_FILE), &config.spec)?;
    } else {
        tracing::info!("runtime lacks CAP_MKNOD - bind mounting devices");
        devices::bind_mount_devices(&mut config.spec)?;
    }

    write_masked_file(&rundir.join(MASKED_FILE), &config.spec)?;

    configure_engine_hooks(rt, &mut items, &config.spec);
    configure_cgroup(rt, &mut items, config)?;

    let spec = &config.spec;
    if let Some(sysctls) = spec.linux().as_ref().and_then(|linux| linux.sysctl().as_ref()) {
        for (key, value) in sysctls {
            items.set(format!("lxc.sysctl.{key}"), value.clone());
        }
    }

    configure_rlimits(&mut items, spec)?;
    configure_log(&mut items, config, rundir);
    configure_mounts(&mut items, spec)?;
    configure_readonly_paths(&mut items, spec)?;

    // without a terminal the engine must not replace the inherited stdio
    // with a PTY
    let terminal = spec
        .process()
        .as_ref()
        .and_then(|process| process.terminal())
        .unwrap_or(false);
    if config.console_socket.is_none() && !terminal {
        items.set("lxc.console.path", "none");
    }

    Ok(items)
}

fn configure_hostname(items: &mut EngineConfig, spec: &Spec) -> Result<()> {
    let Some(hostname) = spec.hostname().as_ref().filter(|name| !name.is_empty()) else {
        return Ok(());
    };
    items.set("lxc.uts.name", hostname.clone());

    // when joining an existing UTS namespace the engine does not set the
    // hostname; do it from a scoped thread so this process stays in its
    // own namespace
    if let Some(uts) = namespace(spec, LinuxNamespaceType::Uts) {
        if let Some(path) = uts.path().as_ref().filter(|p| !p.as_os_str().is_empty()) {
            set_hostname_at(path, hostname)?;
        }
    }
    Ok(())
}

fn set_hostname_at(ns_path: &Path, hostname: &str) -> Result<()> {
    let path = ns_path.to_path_buf();
    let name = hostname.to_string();
    std::thread::spawn(move || -> std::result::Result<(), String> {
        let ns = std::fs::File::open(&path)
            .map_err(|err| format!("failed to open {}: {err}", path.display()))?;
        setns(&ns, CloneFlags::CLONE_NEWUTS)
            .map_err(|err| format!("failed to enter uts namespace {}: {err}", path.display()))?;
        sethostname(&name).map_err(|err| format!("sethostname failed: {err}"))
    })
    .join()
    .map_err(|_| Error::system("failed to set hostname", "hostname thread panicked".to_string()))?
    .map_err(|msg| Error::system("failed to set hostname", msg))
}

fn configure_rootfs(rt: &Runtime, items: &mut EngineConfig, spec: &Spec) -> Result<()> {
    let root = spec
        .root()
        .as_ref()
        .ok_or_else(|| Error::invalid_config("spec has no root"))?;

    items.set("lxc.rootfs.path", root.path().display().to_string());
    items.set(
        "lxc.rootfs.mount",
        rt.rootfs_mount().display().to_string(),
    );
    items.set("lxc.rootfs.managed", "0");
    // resources not created by the runtime must not be deleted by it
    items.set("lxc.ephemeral", "0");

    let mut options = Vec::new();
    if let Some(linux) = spec.linux() {
        if let Some(propagation) = linux.rootfs_propagation().as_ref().filter(|p| !p.is_empty()) {
            options.push(propagation.clone());
        }
    }
    if root.readonly().unwrap_or(false) {
        options.push("ro".to_string());
    }
    items.set("lxc.rootfs.options", options.join(","));
    Ok(())
}

/// Prepares the init handshake: the runtime directory is bind mounted
/// into the container at `/.lxcri`, where `lxcri-init` reads the sync
/// FIFO, the NUL separated `cmdline` and `environ` files and the `cwd`
/// symlink. The init binary itself is bind mounted from the libexec
/// directory on top.
fn configure_init(rt: &Runtime, items: &mut EngineConfig, spec: &Spec, rundir: &Path) -> Result<()> {
    let process = spec
        .process()
        .as_ref()
        .ok_or_else(|| Error::invalid_config("spec has no process"))?;
    let args = process
        .args()
        .as_ref()
        .ok_or_else(|| Error::invalid_config("spec process has no args"))?;

    write_nul_separated(&rundir.join("cmdline"), args.iter())?;
    let empty = Vec::new();
    let env = process.env().as_ref().unwrap_or(&empty);
    write_nul_separated(&rundir.join("environ"), env.iter())?;

    let cwd = rundir.join("cwd");
    symlink(process.cwd(), &cwd)
        .map_err(|err| Error::system(format!("failed to symlink {}", cwd.display()), err))?;

    let fifo = rundir.join(SYNC_FIFO);
    mkfifo(&fifo, Mode::from_bits_truncate(0o666))
        .map_err(|err| Error::system(format!("failed to create fifo {}", fifo.display()), err))?;

    let init_dir = INIT_DIR.trim_start_matches('/');
    items.set(
        "lxc.mount.entry",
        format!("{} {init_dir} none bind,ro,create=dir 0 0", rundir.display()),
    );
    items.set(
        "lxc.mount.entry",
        format!(
            "{} {init_dir}/lxcri-init none bind,ro,create=file 0 0",
            rt.libexec(crate::runtime::EXEC_INIT).display()
        ),
    );
    items.set("lxc.init.cwd", INIT_DIR);
    items.set("lxc.init.cmd", format!("{INIT_DIR}/lxcri-init"));
    items.set("lxc.init.uid", process.user().uid().to_string());
    items.set("lxc.init.gid", process.user().gid().to_string());
    Ok(())
}

fn write_nul_separated<'a>(
    path: &Path,
    values: impl Iterator<Item = &'a String>,
) -> Result<()> {
    let mut buf = Vec::new();
    for value in values {
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    }
    std::fs::write(path, buf)
        .map_err(|err| Error::system(format!("failed to write {}", path.display()), err))
}

pub(crate) fn namespace(spec: &Spec, typ: LinuxNamespaceType) -> Option<&LinuxNamespace> {
    spec.linux()
        .as_ref()
        .and_then(|linux| linux.namespaces().as_ref())
        .and_then(|namespaces| namespaces.iter().find(|ns| ns.typ() == typ))
}

fn has_namespace(spec: &Spec, typ: LinuxNamespaceType) -> bool {
    namespace(spec, typ).is_some()
}

fn add_user_namespace(spec: &mut Spec) -> Result<()> {
    let Some(mut linux) = spec.linux().clone() else {
        return Err(Error::invalid_config("spec has no linux block"));
    };
    let mut namespaces = linux.namespaces().clone().unwrap_or_default();
    namespaces.push(
        oci_spec::runtime::LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::User)
            .build()
            .map_err(|err| Error::invalid_config(format!("invalid user namespace: {err}")))?,
    );
    linux.set_namespaces(Some(namespaces));
    spec.set_linux(Some(linux));
    Ok(())
}

/// Engine name of a namespace type.
pub(crate) fn namespace_name(typ: LinuxNamespaceType) -> &'static str {
    match typ {
        LinuxNamespaceType::Mount => "mnt",
        LinuxNamespaceType::Cgroup => "cgroup",
        LinuxNamespaceType::Uts => "uts",
        LinuxNamespaceType::Ipc => "ipc",
        LinuxNamespaceType::User => "user",
        LinuxNamespaceType::Pid => "pid",
        LinuxNamespaceType::Network => "net",
        LinuxNamespaceType::Time => "time",
    }
}

/// Namespaces without a path are cloned; namespaces with a path are
/// joined.
fn configure_namespaces(items: &mut EngineConfig, spec: &Spec) -> Result<()> {
    let empty = Vec::new();
    let namespaces = spec
        .linux()
        .as_ref()
        .and_then(|linux| linux.namespaces().as_ref())
        .unwrap_or(&empty);

    let mut cloned = Vec::new();
    for ns in namespaces {
        let name = namespace_name(ns.typ());
        match ns.path().as_ref().filter(|p| !p.as_os_str().is_empty()) {
            None => cloned.push(name),
            Some(path) => items.set(
                format!("lxc.namespace.share.{name}"),
                path.display().to_string(),
            ),
        }
    }
    if !cloned.is_empty() {
        items.set("lxc.namespace.clone", cloned.join(" "));
    }
    Ok(())
}

fn configure_id_mappings(items: &mut EngineConfig, spec: &Spec) {
    let Some(linux) = spec.linux() else { return };
    for (flag, mappings) in [("u", linux.uid_mappings()), ("g", linux.gid_mappings())] {
        if let Some(mappings) = mappings {
            for mapping in mappings {
                items.set(
                    "lxc.idmap",
                    format!(
                        "{flag} {} {} {}",
                        mapping.container_id(),
                        mapping.host_id(),
                        mapping.size()
                    ),
                );
            }
        }
    }
}

fn configure_apparmor(items: &mut EngineConfig, spec: &Spec) {
    let profile = spec
        .process()
        .as_ref()
        .and_then(|process| process.apparmor_profile().clone())
        .filter(|profile| !profile.is_empty())
        .unwrap_or_else(|| "unconfined".to_string());
    items.set("lxc.apparmor.profile", profile);
}

fn configure_seccomp(items: &mut EngineConfig, spec: &Spec, rundir: &Path) -> Result<()> {
    let Some(seccomp) = spec.linux().as_ref().and_then(|linux| linux.seccomp().as_ref()) else {
        return Ok(());
    };
    if seccomp.syscalls().as_ref().map_or(true, |s| s.is_empty()) {
        return Ok(());
    }
    let profile = rundir.join(SECCOMP_PROFILE_FILE);
    seccomp::write_profile(&profile, seccomp)?;
    items.set("lxc.seccomp.profile", profile.display().to_string());
    Ok(())
}

/// Grants the permitted capability set, or the literal "none" when the
/// spec keeps nothing.
fn configure_capabilities(items: &mut EngineConfig, spec: &Spec) {
    let mut keep: Vec<&'static str> = spec
        .process()
        .as_ref()
        .and_then(|process| process.capabilities().as_ref())
        .and_then(|capabilities| capabilities.permitted().as_ref())
        .map(|permitted| permitted.iter().map(cap_name).collect())
        .unwrap_or_default();
    keep.sort_unstable();

    let value = if keep.is_empty() {
        "none".to_string()
    } else {
        keep.join(" ")
    };
    items.set("lxc.cap.keep", value);
}

/// Engine capability name: lowercased, without the CAP_ prefix.
fn cap_name(cap: &Capability) -> &'static str {
    match cap {
        Capability::AuditControl => "audit_control",
        Capability::AuditRead => "audit_read",
        Capability::AuditWrite => "audit_write",
        Capability::BlockSuspend => "block_suspend",
        Capability::Bpf => "bpf",
        Capability::CheckpointRestore => "checkpoint_restore",
        Capability::Chown => "chown",
        Capability::DacOverride => "dac_override",
        Capability::DacReadSearch => "dac_read_search",
        Capability::Fowner => "fowner",
        Capability::Fsetid => "fsetid",
        Capability::IpcLock => "ipc_lock",
        Capability::IpcOwner => "ipc_owner",
        Capability::Kill => "kill",
        Capability::Lease => "lease",
        Capability::LinuxImmutable => "linux_immutable",
        Capability::MacAdmin => "mac_admin",
        Capability::MacOverride => "mac_override",
        Capability::Mknod => "mknod",
        Capability::NetAdmin => "net_admin",
        Capability::NetBindService => "net_bind_service",
        Capability::NetBroadcast => "net_broadcast",
        Capability::NetRaw => "net_raw",
        Capability::Perfmon => "perfmon",
        Capability::Setgid => "setgid",
        Capability::Setfcap => "setfcap",
        Capability::Setpcap => "setpcap",
        Capability::Setuid => "setuid",
        Capability::SysAdmin => "sys_admin",
        Capability::SysBoot => "sys_boot",
        Capability::SysChroot => "sys_chroot",
        Capability::SysModule => "sys_module",
        Capability::SysNice => "sys_nice",
        Capability::SysPacct => "sys_pacct",
        Capability::SysPtrace => "sys_ptrace",
        Capability::SysRawio => "sys_rawio",
        Capability::SysResource => "sys_resource",
        Capability::SysTime => "sys_time",
        Capability::SysTtyConfig => "sys_tty_config",
        Capability::Syslog => "syslog",
        Capability::WakeAlarm => "wake_alarm",
    }
}

fn write_masked_file(path: &Path, spec: &Spec) -> Result<()> {
    let Some(masked) = spec
        .linux()
        .as_ref()
        .and_then(|linux| linux.masked_paths().as_ref())
    else {
        return Ok(());
    };
    let mut buf = Vec::new();
    for masked_path in masked {
        writeln!(buf, "{masked_path}")
            .map_err(|err| Error::system(format!("failed to write {}", path.display()), err))?;
    }
    std::fs::write(path, buf)
        .map_err(|err| Error::system(format!("failed to write {}", path.display()), err))
}

/// Registers the hook binary at the engine hook points that correspond
/// to the OCI hooks present in the spec.
fn configure_engine_hooks(rt: &Runtime, items: &mut EngineConfig, spec: &Spec) {
    let Some(hooks) = spec.hooks() else {
        items.set("lxc.hook.version", "1");
        return;
    };
    items.set("lxc.hook.version", "1");

    let hook_bin = rt.libexec(crate::runtime::EXEC_HOOK).display().to_string();
    let some = |list: &Option<Vec<oci_spec::runtime::Hook>>| {
        list.as_ref().map_or(false, |hooks| !hooks.is_empty())
    };

    if some(hooks.prestart()) || some(hooks.create_runtime()) {
        items.set("lxc.hook.pre-mount", hook_bin.clone());
    }
    if some(hooks.create_container()) {
        items.set("lxc.hook.mount", hook_bin.clone());
    }
    if some(hooks.start_container()) {
        items.set("lxc.hook.start", hook_bin);
    }
}

fn configure_cgroup(
    rt: &Runtime,
    items: &mut EngineConfig,
    config: &mut ContainerConfig,
) -> Result<()> {
    let cgroups_path = config
        .spec
        .linux()
        .as_ref()
        .and_then(|linux| linux.cgroups_path().clone());
    let dir = cgroup::resolve_cgroup_dir(
        cgroups_path.as_deref(),
        config.systemd_cgroup,
        &config.container_id,
    )?;
    cgroup::create_cgroup(rt.cgroup_root(), &dir)?;

    items.set("lxc.cgroup.dir", dir.display().to_string());
    if let Some(monitor_cgroup) = rt.monitor_cgroup.as_ref() {
        let monitor_dir = PathBuf::from(monitor_cgroup).join(&config.container_id);
        if rt.engine().supports_config_item("lxc.cgroup.dir.monitor") {
            items.set("lxc.cgroup.dir.monitor", monitor_dir.display().to_string());
            config.monitor_cgroup_dir = Some(monitor_dir);
        } else {
            tracing::warn!("engine does not support a monitor cgroup directory");
        }
    }
    config.cgroup_dir = dir;

    if let Some(resources) = config
        .spec
        .linux()
        .as_ref()
        .and_then(|linux| linux.resources().as_ref())
    {
        cgroup::resources_to_items(items, resources, rt.features.cgroup_devices);
    }
    Ok(())
}

/// A limit not configured here is inherited from the monitor process.
fn configure_rlimits(items: &mut EngineConfig, spec: &Spec) -> Result<()> {
    let Some(rlimits) = spec
        .process()
        .as_ref()
        .and_then(|process| process.rlimits().as_ref())
    else {
        return Ok(());
    };

    let mut seen: Vec<&'static str> = Vec::new();
    for rlimit in rlimits {
        let name = rlimit_name(rlimit.typ());
        if seen.contains(&name) {
            return Err(Error::invalid_config(format!(
                "duplicate resource limit {name:?}"
            )));
        }
        seen.push(name);
        items.set(
            format!("lxc.prlimit.{name}"),
            format!("{}:{}", rlimit.soft(), rlimit.hard()),
        );
    }
    Ok(())
}

/// Engine rlimit name: lowercased, without the RLIMIT_ prefix.
fn rlimit_name(typ: PosixRlimitType) -> &'static str {
    match typ {
        PosixRlimitType::RlimitCpu => "cpu",
        PosixRlimitType::RlimitFsize => "fsize",
        PosixRlimitType::RlimitData => "data",
        PosixRlimitType::RlimitStack => "stack",
        PosixRlimitType::RlimitCore => "core",
        PosixRlimitType::RlimitRss => "rss",
        PosixRlimitType::RlimitNproc => "nproc",
        PosixRlimitType::RlimitNofile => "nofile",
        PosixRlimitType::RlimitMemlock => "memlock",
        PosixRlimitType::RlimitAs => "as",
        PosixRlimitType::RlimitLocks => "locks",
        PosixRlimitType::RlimitSigpending => "sigpending",
        PosixRlimitType::RlimitMsgqueue => "msgqueue",
        PosixRlimitType::RlimitNice => "nice",
        PosixRlimitType::RlimitRtprio => "rtprio",
        PosixRlimitType::RlimitRttime => "rttime",
    }
}

fn configure_log(items: &mut EngineConfig, config: &ContainerConfig, rundir: &Path) {
    let log_file = config
        .log_file
        .clone()
        .unwrap_or_else(|| rundir.join("engine.log"));
    items.set("lxc.log.file", log_file.display().to_string());
    items.set(
        "lxc.log.level",
        engine_log_level(config.log_level.as_deref()),
    );
}

fn engine_log_level(level: Option<&str>) -> &'static str {
    match level.map(|level| level.to_ascii_lowercase()).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("notice") => "notice",
        Some("warn") | None => "warn",
        Some("error") => "error",
        Some("crit") => "crit",
        Some("alert") => "alert",
        Some("fatal") => "fatal",
        Some(other) => {
            tracing::warn!(level = other, "unknown log level, using warn");
            "warn"
        }
    }
}

/// Forwards the spec's mounts as engine mount entries. Target paths are
/// created inside the rootfs via the `create=` option when missing.
fn configure_mounts(items: &mut EngineConfig, spec: &Spec) -> Result<()> {
    let Some(mounts) = spec.mounts() else {
        return Ok(());
    };
    for mount in mounts {
        let destination = mount.destination().to_string_lossy();
        let destination = destination.trim_start_matches('/');
        if destination.is_empty() {
            return Err(Error::invalid_config("mount with empty destination"));
        }
        let source = mount
            .source()
            .as_ref()
            .map(|source| source.display().to_string())
            .unwrap_or_default();
        let typ = mount.typ().clone().unwrap_or_else(|| "none".to_string());

        let mut options = mount.options().clone().unwrap_or_default();
        let is_bind = typ == "bind"
            || options.iter().any(|opt| opt == "bind" || opt == "rbind");
        if is_bind && !options.iter().any(|opt| opt.starts_with("create=")) {
            let create = if Path::new(&source).is_dir() {
                "create=dir"
            } else {
                "create=file"
            };
            options.push(create.to_string());
        }

        items.set(
            "lxc.mount.entry",
            format!("{source} {destination} {typ} {} 0 0", options.join(",")),
        );
    }
    Ok(())
}

/// Read-only paths become optional read-only bind mounts below the
/// rootfs pivot.
fn configure_readonly_paths(items: &mut EngineConfig, spec: &Spec) -> Result<()> {
    let Some(paths) = spec
        .linux()
        .as_ref()
        .and_then(|linux| linux.readonly_paths().as_ref())
    else {
        return Ok(());
    };
    let rootfs_mount = items
        .get("lxc.rootfs.mount")
        .ok_or_else(|| Error::invalid_config("lxc.rootfs.mount unavailable"))?
        .to_string();

    for path in paths {
        let relative = path.trim_start_matches('/');
        items.set(
            "lxc.mount.entry",
            format!("{rootfs_mount}/{relative} {relative} bind bind,ro,optional 0 0"),
        );
    }
    Ok(())
}
