//! Generates seccomp profiles in the engine's native (version 2) text
//! format from the spec's seccomp block.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use oci_spec::runtime::{
    Arch, LinuxSeccomp, LinuxSeccompAction, LinuxSeccompOperator, LinuxSyscall,
};

use crate::error::{Error, Result};

/// Writes the profile:
///
/// ```text
/// 2
/// allowlist <default-action>
/// [<arch>]
/// <syscall> <action> [<index>,<value>,<op>,<valueTwo>]
/// ```
///
/// When a syscall carries argument comparisons, one line is emitted per
/// argument: the engine forbids comparing the same argument index twice
/// within a single rule.
pub fn write_profile(path: &Path, seccomp: &LinuxSeccomp) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o440)
        .open(path)
        .map_err(|err| Error::system(format!("failed to create {}", path.display()), err))?;
    let mut writer = BufWriter::new(file);

    let io_err = |err| Error::system(format!("failed to write {}", path.display()), err);

    writeln!(writer, "2").map_err(io_err)?;
    writeln!(writer, "allowlist {}", default_action(seccomp)?).map_err(io_err)?;

    for arch in profile_archs(seccomp) {
        writeln!(writer, "[{arch}]").map_err(io_err)?;
        if let Some(syscalls) = seccomp.syscalls() {
            for syscall in syscalls {
                write_syscall(&mut writer, syscall).map_err(|err| match err {
                    WriteSyscallError::Io(err) => io_err(err),
                    WriteSyscallError::UnsupportedAction(action) => Error::invalid_config(
                        format!("unsupported seccomp action {action:?}"),
                    ),
                })?;
            }
        }
    }
    writer.flush().map_err(io_err)
}

fn default_action(seccomp: &LinuxSeccomp) -> Result<String> {
    let action = match seccomp.default_action() {
        LinuxSeccompAction::ScmpActKill => "kill".to_string(),
        LinuxSeccompAction::ScmpActTrap => "trap".to_string(),
        LinuxSeccompAction::ScmpActErrno => "errno 0".to_string(),
        LinuxSeccompAction::ScmpActAllow => "allow".to_string(),
        // not supported by the engine
        unsupported @ (LinuxSeccompAction::ScmpActTrace | LinuxSeccompAction::ScmpActLog) => {
            tracing::warn!(
                action = ?unsupported,
                "unsupported seccomp default action, falling back to kill"
            );
            "kill".to_string()
        }
        other => {
            return Err(Error::invalid_config(format!(
                "unsupported seccomp default action {other:?}"
            )))
        }
    };
    Ok(action)
}

enum WriteSyscallError {
    Io(std::io::Error),
    UnsupportedAction(LinuxSeccompAction),
}

impl From<std::io::Error> for WriteSyscallError {
    fn from(err: std::io::Error) -> Self {
        WriteSyscallError::Io(err)
    }
}

fn write_syscall(
    writer: &mut impl Write,
    syscall: &LinuxSyscall,
) -> std::result::Result<(), WriteSyscallError> {
    let action = match syscall.action() {
        LinuxSeccompAction::ScmpActKill => "kill".to_string(),
        LinuxSeccompAction::ScmpActTrap => "trap".to_string(),
        LinuxSeccompAction::ScmpActAllow => "allow".to_string(),
        LinuxSeccompAction::ScmpActErrno => {
            format!("errno {}", syscall.errno_ret().unwrap_or(0))
        }
        other => return Err(WriteSyscallError::UnsupportedAction(other)),
    };

    for name in syscall.names() {
        match syscall.args().as_deref() {
            None | Some([]) => writeln!(writer, "{name} {action}")?,
            Some(args) => {
                for arg in args {
                    writeln!(
                        writer,
                        "{name} {action} [{},{},{},{}]",
                        arg.index(),
                        arg.value(),
                        operator_name(arg.op()),
                        arg.value_two().unwrap_or(0),
                    )?;
                }
            }
        }
    }
    Ok(())
}

fn operator_name(op: LinuxSeccompOperator) -> &'static str {
    match op {
        LinuxSeccompOperator::ScmpCmpNe => "SCMP_CMP_NE",
        LinuxSeccompOperator::ScmpCmpLt => "SCMP_CMP_LT",
        LinuxSeccompOperator::ScmpCmpLe => "SCMP_CMP_LE",
        LinuxSeccompOperator::ScmpCmpEq => "SCMP_CMP_EQ",
        LinuxSeccompOperator::ScmpCmpGe => "SCMP_CMP_GE",
        LinuxSeccompOperator::ScmpCmpGt => "SCMP_CMP_GT",
        LinuxSeccompOperator::ScmpCmpMaskedEq => "SCMP_CMP_MASKED_EQ",
    }
}

/// Architecture sections of the profile.
///
/// When the spec lists the host's native architecture, only that one is
/// emitted: the engine synthesizes rules for compat architectures on its
/// own.
fn profile_archs(seccomp: &LinuxSeccomp) -> Vec<String> {
    let native = native_arch();
    let mut archs = Vec::new();
    if let Some(spec_archs) = seccomp.architectures() {
        for arch in spec_archs {
            let name = arch_name(*arch);
            if Some(name) == native.as_deref() {
                return vec![name.to_string()];
            }
            archs.push(name.to_string());
        }
    }
    if archs.is_empty() {
        if let Some(native) = native {
            archs.push(native);
        }
    }
    archs
}

fn native_arch() -> Option<String> {
    nix::sys::utsname::uname()
        .ok()
        .map(|uts| uts.machine().to_string_lossy().to_ascii_lowercase())
}

/// Lowercased architecture name with the `SCMP_ARCH_` prefix stripped.
fn arch_name(arch: Arch) -> &'static str {
    match arch {
        Arch::ScmpArchNative => "native",
        Arch::ScmpArchX86 => "x86",
        Arch::ScmpArchX86_64 => "x86_64",
        Arch::ScmpArchX32 => "x32",
        Arch::ScmpArchArm => "arm",
        Arch::ScmpArchAarch64 => "aarch64",
        Arch::ScmpArchMips => "mips",
        Arch::ScmpArchMips64 => "mips64",
        Arch::ScmpArchMips64n32 => "mips64n32",
        Arch::ScmpArchMipsel => "mipsel",
        Arch::ScmpArchMipsel64 => "mipsel64",
        Arch::ScmpArchMipsel64n32 => "mipsel64n32",
        Arch::ScmpArchPpc => "ppc",
        Arch::ScmpArchPpc64 => "ppc64",
        Arch::ScmpArchPpc64le => "ppc64le",
        Arch::ScmpArchS390 => "s390",
        Arch::ScmpArchS390x => "s390x",
    }
}
