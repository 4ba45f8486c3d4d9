//! Small filesystem helpers shared across the runtime.

use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::sys::statfs::{statfs, FsType};
use nix::unistd::{access, AccessFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Serializes `value` as JSON to `path` with exclusive create semantics,
/// so that a concurrent create of the same container aborts instead of
/// clobbering state.
pub fn create_json_file<T: Serialize>(path: &Path, value: &T, mode: u32) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .map_err(|err| Error::system(format!("failed to create {}", path.display()), err))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)
        .map_err(|err| Error::system(format!("failed to encode {}", path.display()), err))?;
    writer
        .flush()
        .map_err(|err| Error::system(format!("failed to write {}", path.display()), err))?;
    Ok(())
}

pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path)
        .map_err(|err| Error::system(format!("failed to open {}", path.display()), err))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|err| Error::system(format!("failed to decode {}", path.display()), err))
}

/// Checks that `path` is the mount point of a filesystem with the given
/// magic number.
pub fn is_filesystem(path: &Path, fs_name: &str, magic: FsType) -> std::result::Result<(), String> {
    match statfs(path) {
        Ok(stat) if stat.filesystem_type() == magic => Ok(()),
        Ok(stat) => Err(format!(
            "{} is not {fs_name} (magic {:#x})",
            path.display(),
            stat.filesystem_type().0
        )),
        Err(err) => Err(format!("statfs {} failed: {err}", path.display())),
    }
}

/// Verifies that every given path is an executable file for the caller.
pub fn can_execute<'a>(paths: impl IntoIterator<Item = &'a Path>) -> std::result::Result<(), String> {
    for path in paths {
        access(path, AccessFlags::X_OK)
            .map_err(|err| format!("{} is not executable: {err}", path.display()))?;
    }
    Ok(())
}

pub fn write_pid_file(path: &Path, pid: i32) -> Result<()> {
    std::fs::write(path, format!("{pid}\n"))
        .map_err(|err| Error::system(format!("failed to write pid file {}", path.display()), err))
}
