//! Execution of OCI lifecycle hooks.
//!
//! A hook receives the OCI state document on stdin and must exit zero.
//! CreateRuntime hook failures are logged but do not abort create; the
//! engine-side hook points (pre-mount, mount, start) are registered by
//! the spec translator instead.

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::os::unix::prelude::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use oci_spec::runtime::Hook;

use crate::container::OciState;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("failed to execute hook command")]
    CommandExecute(#[source] std::io::Error),
    #[error("failed to encode container state")]
    EncodeState(#[source] serde_json::Error),
    #[error("failed to write container state to stdin")]
    WriteState(#[source] std::io::Error),
    #[error("hook command exited with non-zero exit code: {0}")]
    NonZeroExitCode(i32),
    #[error("hook command was killed by a signal")]
    Killed,
    #[error("hook command timed out")]
    Timeout,
}

fn parse_env(envs: &[String]) -> HashMap<String, String> {
    envs.iter()
        .filter_map(|kv| {
            kv.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Runs the given hooks in order, aborting on the first failure.
pub fn run_hooks(hooks: &[Hook], state: &OciState) -> Result<(), HookError> {
    let encoded_state = serde_json::to_string(state).map_err(HookError::EncodeState)?;

    for hook in hooks {
        let mut command = Command::new(hook.path());
        // arg0 may differ from the executable path
        if let Some((arg0, args)) = hook.args().as_ref().and_then(|args| args.split_first()) {
            command.arg0(arg0).args(args);
        } else {
            command.arg0(hook.path());
        }
        let envs = hook.env().as_deref().map(parse_env).unwrap_or_default();

        let mut child = command
            .env_clear()
            .envs(envs)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(HookError::CommandExecute)?;
        let child_pid = Pid::from_raw(child.id() as i32);

        if let Some(stdin) = &mut child.stdin {
            // A broken pipe only means the hook did not read the state;
            // its exit code decides success below.
            if let Err(err) = stdin.write_all(encoded_state.as_bytes()) {
                if err.kind() != ErrorKind::BrokenPipe {
                    let _ = signal::kill(child_pid, Signal::SIGKILL);
                    return Err(HookError::WriteState(err));
                }
            }
        }
        drop(child.stdin.take());

        let status = match hook.timeout() {
            Some(timeout_sec) => {
                // wait in a helper thread; the channel provides the
                // timeout the process API lacks
                let (sender, receiver) = std::sync::mpsc::channel();
                std::thread::spawn(move || {
                    let _ = sender.send(child.wait());
                });
                match receiver.recv_timeout(Duration::from_secs(timeout_sec.max(0) as u64)) {
                    Ok(status) => status,
                    Err(_) => {
                        let _ = signal::kill(child_pid, Signal::SIGKILL);
                        return Err(HookError::Timeout);
                    }
                }
            }
            None => child.wait(),
        };

        match status.map_err(HookError::CommandExecute)?.code() {
            Some(0) => {}
            Some(code) => return Err(HookError::NonZeroExitCode(code)),
            None => return Err(HookError::Killed),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Context, Result};
    use oci_spec::runtime::HookBuilder;
    use serial_test::serial;

    // The state is piped into the hook's stdin; running in serial keeps
    // the pipes from getting flaky under parallel test load.

    #[test]
    #[serial]
    fn test_run_hooks_success_and_env() -> Result<()> {
        let state = OciState::default();
        run_hooks(&[], &state).context("empty hook list")?;

        let hook = HookBuilder::default().path("/bin/true").build()?;
        run_hooks(&[hook], &state).context("true hook")?;

        let hook = HookBuilder::default()
            .path("/bin/sh")
            .args(vec![
                "sh".to_string(),
                "-c".to_string(),
                "test \"$key\" = value".to_string(),
            ])
            .env(vec!["key=value".to_string()])
            .build()?;
        run_hooks(&[hook], &state).context("env hook")?;
        Ok(())
    }

    #[test]
    #[serial]
    fn test_run_hooks_reads_state() -> Result<()> {
        let state = OciState {
            id: "hooked".to_string(),
            ..Default::default()
        };
        let hook = HookBuilder::default()
            .path("/bin/sh")
            .args(vec![
                "sh".to_string(),
                "-c".to_string(),
                "grep -q hooked".to_string(),
            ])
            .build()?;
        run_hooks(&[hook], &state)?;
        Ok(())
    }

    #[test]
    #[serial]
    fn test_run_hooks_nonzero_exit() -> Result<()> {
        let hook = HookBuilder::default().path("/bin/false").build()?;
        match run_hooks(&[hook], &OciState::default()) {
            Err(HookError::NonZeroExitCode(1)) => Ok(()),
            other => bail!("expected exit code failure, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_run_hooks_timeout() -> Result<()> {
        let hook = HookBuilder::default()
            .path("/bin/sh")
            .args(vec![
                "sh".to_string(),
                "-c".to_string(),
                "sleep 10".to_string(),
            ])
            .timeout(1i64)
            .build()?;
        match run_hooks(&[hook], &OciState::default()) {
            Err(HookError::Timeout) => Ok(()),
            other => bail!("expected timeout, got {other:?}"),
        }
    }
}
