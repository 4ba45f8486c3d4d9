//! The first process inside the container.
//!
//! The runtime bind mounts its per-container directory at `/.lxcri` and
//! starts this binary with that directory as working directory. The
//! protocol:
//!
//! 1. open `syncfifo` read-only; this blocks until the runtime's start
//!    verb opens the write side,
//! 2. read until EOF (the runtime closes without writing),
//! 3. load argv from `cmdline` and the environment from `environ` (both
//!    NUL separated), chdir through the `cwd` symlink and exec.
//!
//! While this process waits on the FIFO its argv[0] is the sentinel the
//! runtime probes to distinguish `created` from `running`.

use std::ffi::CString;
use std::io::Read;
use std::os::unix::ffi::OsStringExt;
use std::process::ExitCode;

const SYNC_FIFO: &str = "syncfifo";
const CMDLINE: &str = "cmdline";
const ENVIRON: &str = "environ";
const CWD: &str = "cwd";

fn main() -> ExitCode {
    match run() {
        Ok(never) => never,
        Err((code, msg)) => {
            eprintln!("[lxcri-init] {msg}");
            ExitCode::from(code)
        }
    }
}

fn run() -> Result<ExitCode, (u8, String)> {
    wait_for_start().map_err(|msg| (220, msg))?;

    let args = read_nul_separated(CMDLINE).map_err(|msg| (200, msg))?;
    if args.is_empty() {
        return Err((205, "empty cmdline".to_string()));
    }
    let mut env = read_nul_separated(ENVIRON).map_err(|msg| (210, msg))?;
    ensure_home(&mut env);

    std::env::set_current_dir(CWD).map_err(|err| (221, format!("chdir failed: {err}")))?;

    let argv: Vec<CString> = args
        .into_iter()
        .map(CString::new)
        .collect::<Result<_, _>>()
        .map_err(|_| (201, "NUL byte in argument".to_string()))?;
    let envp: Vec<CString> = env
        .into_iter()
        .map(CString::new)
        .collect::<Result<_, _>>()
        .map_err(|_| (211, "NUL byte in environment".to_string()))?;

    nix::unistd::execvpe(&argv[0], &argv, &envp)
        .map_err(|err| (222, format!("failed to exec: {err}")))?;
    unreachable!("execvpe returned without error");
}

/// Blocks on the FIFO until the runtime signals the start by closing the
/// write side.
fn wait_for_start() -> Result<(), String> {
    let mut fifo = std::fs::File::open(SYNC_FIFO)
        .map_err(|err| format!("failed to open {SYNC_FIFO}: {err}"))?;
    let mut buf = [0u8; 16];
    loop {
        match fifo.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(err) => return Err(format!("failed to read {SYNC_FIFO}: {err}")),
        }
    }
}

fn read_nul_separated(path: &str) -> Result<Vec<String>, String> {
    let content = std::fs::read(path).map_err(|err| format!("failed to read {path}: {err}"))?;
    let mut values = Vec::new();
    for chunk in content.split(|byte| *byte == 0) {
        if chunk.is_empty() {
            continue;
        }
        let value = String::from_utf8(chunk.to_vec())
            .map_err(|_| format!("{path} is not valid UTF-8"))?;
        values.push(value);
    }
    Ok(values)
}

/// Some images rely on HOME being present; default it from the passwd
/// entry of the effective user, or "/".
fn ensure_home(env: &mut Vec<String>) {
    if env.iter().any(|entry| entry.starts_with("HOME=")) {
        return;
    }
    let home = nix::unistd::User::from_uid(nix::unistd::geteuid())
        .ok()
        .flatten()
        .map(|user| user.dir.into_os_string().into_vec())
        .and_then(|dir| String::from_utf8(dir).ok())
        .filter(|dir| !dir.is_empty())
        .unwrap_or_else(|| "/".to_string());
    env.push(format!("HOME={home}"));
}
