//! Device policy: mandatory default devices, the `devices.txt` side file
//! consumed by `lxcri-hook`, and the bind-mount fallback for callers
//! without CAP_MKNOD.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use oci_spec::runtime::{
    LinuxDeviceBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType, Mount,
    MountBuilder, Spec,
};

use crate::error::{Error, Result};

/// Mandatory devices every container gets, per the runtime spec's
/// default device list.
const DEFAULT_DEVICES: [(&str, i64, i64); 6] = [
    ("/dev/null", 1, 3),
    ("/dev/zero", 1, 5),
    ("/dev/full", 1, 7),
    ("/dev/random", 1, 8),
    ("/dev/urandom", 1, 9),
    ("/dev/tty", 5, 0),
];

fn device_enabled(spec: &Spec, path: &str) -> bool {
    spec.linux()
        .as_ref()
        .and_then(|linux| linux.devices().as_ref())
        .map(|devices| devices.iter().any(|dev| dev.path() == Path::new(path)))
        .unwrap_or(false)
}

fn device_cgroup_entry(
    typ: LinuxDeviceType,
    major: Option<i64>,
    minor: Option<i64>,
) -> Result<LinuxDeviceCgroup> {
    let mut builder = LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(typ)
        .access("rwm");
    if let Some(major) = major {
        builder = builder.major(major);
    }
    if let Some(minor) = minor {
        builder = builder.minor(minor);
    }
    builder
        .build()
        .map_err(|err| Error::invalid_config(format!("invalid device cgroup entry: {err}")))
}

/// Ensures the mandatory default devices are present in the spec, with
/// mode 0666 and the process UID/GID, and grants cgroup device access
/// for them plus `/dev/ptmx` and `/dev/pts/*`.
pub fn ensure_default_devices(spec: &mut Spec) -> Result<()> {
    let (uid, gid) = spec
        .process()
        .as_ref()
        .map(|process| (process.user().uid(), process.user().gid()))
        .unwrap_or((0, 0));

    let mut devices = spec
        .linux()
        .as_ref()
        .and_then(|linux| linux.devices().clone())
        .unwrap_or_default();
    let mut cgroup_entries = Vec::new();

    // /dev/ptmx and the pts devices are created by the devpts mount; they
    // only need cgroup permissions
    cgroup_entries.push(device_cgroup_entry(LinuxDeviceType::C, Some(5), Some(2))?);
    cgroup_entries.push(device_cgroup_entry(LinuxDeviceType::C, Some(136), None)?);

    for (path, major, minor) in DEFAULT_DEVICES {
        if !device_enabled(spec, path) {
            let device = LinuxDeviceBuilder::default()
                .path(path)
                .typ(LinuxDeviceType::C)
                .major(major)
                .minor(minor)
                .file_mode(0o666u32)
                .uid(uid)
                .gid(gid)
                .build()
                .map_err(|err| Error::invalid_config(format!("invalid default device: {err}")))?;
            devices.push(device);
        }
        cgroup_entries.push(device_cgroup_entry(
            LinuxDeviceType::C,
            Some(major),
            Some(minor),
        )?);
    }

    let Some(mut linux) = spec.linux().clone() else {
        return Err(Error::invalid_config("spec has no linux block"));
    };
    linux.set_devices(Some(devices));

    let mut resources = linux.resources().clone().unwrap_or_default();
    let mut device_rules = resources.devices().clone().unwrap_or_default();
    device_rules.extend(cgroup_entries);
    resources.set_devices(Some(device_rules));
    linux.set_resources(Some(resources));
    spec.set_linux(Some(linux));

    Ok(())
}

/// Writes `devices.txt` for the hook binary, one device per line:
/// `path type major minor mode uid:gid`.
pub fn write_devices_file(path: &Path, spec: &Spec) -> Result<()> {
    let Some(devices) = spec.linux().as_ref().and_then(|linux| linux.devices().as_ref()) else {
        return Ok(());
    };
    let (default_uid, default_gid) = spec
        .process()
        .as_ref()
        .map(|process| (process.user().uid(), process.user().gid()))
        .unwrap_or((0, 0));

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| Error::system(format!("failed to create {}", path.display()), err))?;
    let mut writer = BufWriter::new(file);
    for device in devices {
        writeln!(
            writer,
            "{} {} {} {} {:o} {}:{}",
            device.path().display(),
            device_type_name(device.typ()),
            device.major(),
            device.minor(),
            device.file_mode().unwrap_or(0o600),
            device.uid().unwrap_or(default_uid),
            device.gid().unwrap_or(default_gid),
        )
        .map_err(|err| Error::system(format!("failed to write {}", path.display()), err))?;
    }
    writer
        .flush()
        .map_err(|err| Error::system(format!("failed to write {}", path.display()), err))
}

fn device_type_name(typ: LinuxDeviceType) -> &'static str {
    match typ {
        LinuxDeviceType::B => "b",
        LinuxDeviceType::C => "c",
        LinuxDeviceType::U => "u",
        LinuxDeviceType::P => "f",
        LinuxDeviceType::A => "a",
    }
}

/// Rewrites the mount list for callers that cannot `mknod`: any `/dev`
/// mount from the spec is dropped, a fresh tmpfs is mounted at `/dev` and
/// every requested device becomes a bind mount from the host.
pub fn bind_mount_devices(spec: &mut Spec) -> Result<()> {
    let devices = spec
        .linux()
        .as_ref()
        .and_then(|linux| linux.devices().clone())
        .unwrap_or_default();

    let mut mounts: Vec<Mount> = spec
        .mounts()
        .as_ref()
        .map(|mounts| {
            mounts
                .iter()
                .filter(|m| {
                    if m.destination() == Path::new("/dev") {
                        tracing::info!("dropping /dev mount in favor of a fresh tmpfs");
                        false
                    } else {
                        true
                    }
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let dev_tmpfs = MountBuilder::default()
        .destination("/dev")
        .source("tmpfs")
        .typ("tmpfs")
        .options(vec![
            "rw".to_string(),
            "nosuid".to_string(),
            "noexec".to_string(),
            "relatime".to_string(),
            "mode=755".to_string(),
        ])
        .build()
        .map_err(|err| Error::invalid_config(format!("invalid /dev tmpfs mount: {err}")))?;
    mounts.push(dev_tmpfs);

    for device in &devices {
        let bind = MountBuilder::default()
            .destination(device.path().clone())
            .source(device.path().clone())
            .typ("bind")
            .options(vec!["bind".to_string(), "create=file".to_string()])
            .build()
            .map_err(|err| Error::invalid_config(format!("invalid device bind mount: {err}")))?;
        mounts.push(bind);
    }

    spec.set_mounts(Some(mounts));
    Ok(())
}

/// Whether the caller may create device nodes.
pub fn can_mknod() -> bool {
    caps::has_cap(None, caps::CapSet::Effective, caps::Capability::CAP_MKNOD).unwrap_or(false)
}
