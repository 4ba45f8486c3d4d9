//! Engine mount hook (hook protocol version 1).
//!
//! Runs inside the container's mount namespace before the pivot. Reads
//! the side files the runtime wrote next to the engine config:
//!
//! - `devices.txt`: `path type major minor mode uid:gid` per line, each
//!   created below the rootfs with mknod + chown,
//! - `masked.txt`: one absolute path per line, masked with a read-only
//!   tmpfs (directories) or a `/dev/null` bind mount (files).
//!
//! The rootfs mount point and the config file location come from the
//! `LXC_ROOTFS_MOUNT` and `LXC_CONFIG_FILE` environment variables.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use nix::mount::{mount, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err((code, msg)) => {
            eprintln!("[lxcri-hook] {msg}");
            ExitCode::from(code)
        }
    }
}

fn run() -> Result<(), (u8, String)> {
    let rootfs = std::env::var("LXC_ROOTFS_MOUNT")
        .map_err(|_| (1, "LXC_ROOTFS_MOUNT environment variable not set".to_string()))?;
    let config_file = std::env::var("LXC_CONFIG_FILE")
        .map_err(|_| (2, "LXC_CONFIG_FILE environment variable not set".to_string()))?;
    let rundir = Path::new(&config_file)
        .parent()
        .ok_or((2, "LXC_CONFIG_FILE has no parent directory".to_string()))?;
    let rootfs = PathBuf::from(rootfs);

    create_devices(&rootfs, &rundir.join("devices.txt")).map_err(|msg| (5, msg))?;
    mask_paths(&rootfs, &rundir.join("masked.txt")).map_err(|msg| (6, msg))?;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct DeviceLine {
    path: PathBuf,
    kind: SFlag,
    major: u64,
    minor: u64,
    mode: u32,
    uid: u32,
    gid: u32,
}

impl FromStr for DeviceLine {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [path, kind, major, minor, mode, owner] = fields[..] else {
            return Err(format!("invalid device line {line:?}"));
        };
        let kind = match kind {
            "b" => SFlag::S_IFBLK,
            "c" | "u" => SFlag::S_IFCHR,
            "f" => SFlag::S_IFIFO,
            other => return Err(format!("unsupported device type {other:?}")),
        };
        let (uid, gid) = owner
            .split_once(':')
            .ok_or_else(|| format!("invalid owner {owner:?}"))?;
        fn parse<T: FromStr>(value: &str, what: &str) -> Result<T, String> {
            value
                .parse()
                .map_err(|_| format!("invalid {what} {value:?}"))
        }
        Ok(DeviceLine {
            path: PathBuf::from(path),
            kind,
            major: parse(major, "major")?,
            minor: parse(minor, "minor")?,
            mode: u32::from_str_radix(mode, 8).map_err(|_| format!("invalid mode {mode:?}"))?,
            uid: parse(uid, "uid")?,
            gid: parse(gid, "gid")?,
        })
    }
}

fn rootfs_path(rootfs: &Path, path: &Path) -> PathBuf {
    let relative = path.strip_prefix("/").unwrap_or(path);
    rootfs.join(relative)
}

fn create_devices(rootfs: &Path, devices_file: &Path) -> Result<(), String> {
    let content = match std::fs::read_to_string(devices_file) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(format!("failed to read {}: {err}", devices_file.display())),
    };

    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        let device: DeviceLine = line.parse()?;
        let target = rootfs_path(rootfs, &device.path);
        if target.exists() {
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("failed to create {}: {err}", parent.display()))?;
        }
        mknod(
            &target,
            device.kind,
            Mode::from_bits_truncate(device.mode),
            makedev(device.major, device.minor),
        )
        .map_err(|err| format!("failed to mknod {}: {err}", target.display()))?;
        chown(
            &target,
            Some(Uid::from_raw(device.uid)),
            Some(Gid::from_raw(device.gid)),
        )
        .map_err(|err| format!("failed to chown {}: {err}", target.display()))?;
    }
    Ok(())
}

fn mask_paths(rootfs: &Path, masked_file: &Path) -> Result<(), String> {
    let content = match std::fs::read_to_string(masked_file) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(format!("failed to read {}: {err}", masked_file.display())),
    };

    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        let target = rootfs_path(rootfs, Path::new(line.trim()));
        let metadata = match std::fs::metadata(&target) {
            Ok(metadata) => metadata,
            // nothing to mask
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(format!("failed to stat {}: {err}", target.display())),
        };

        if metadata.is_dir() {
            mount(
                Some("tmpfs"),
                &target,
                Some("tmpfs"),
                MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|err| format!("failed to mask directory {}: {err}", target.display()))?;
        } else {
            mount(
                Some("/dev/null"),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|err| format!("failed to mask file {}: {err}", target.display()))?;
        }
    }
    Ok(())
}
