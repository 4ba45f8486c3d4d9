//! Launches the monitor process (`lxcri-start`) that supervises the
//! container init for its lifetime.
//!
//! Terminal handling, in order of precedence:
//! 1. a console socket: the child runs on a fresh PTY whose master fd is
//!    passed over the socket as an `SCM_RIGHTS` message with the body
//!    `"terminal"`,
//! 2. `Process.Terminal` without a socket: the engine allocates the PTY
//!    and the monitor keeps the master,
//! 3. neither: stdio is inherited from the caller (the translator sets
//!    `lxc.console.path = none` so the engine leaves it alone).

use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use nix::sys::socket::{self, ControlMessage, MsgFlags, UnixAddr};

use crate::container::Container;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::{Runtime, EXEC_START};

/// Spawns the monitor and returns its PID. The monitor is started with
/// exactly three arguments (container id, runtime root, engine config
/// path), the runtime directory as working directory and the curated
/// environment subset.
pub(crate) fn start_monitor(rt: &Runtime, ctx: &Context, container: &Container) -> Result<i32> {
    let mut command = Command::new(rt.libexec(EXEC_START));
    command
        .arg(container.id())
        .arg(&rt.root)
        .arg(container.config_file_path())
        .env_clear()
        .envs(rt.env.iter().cloned())
        .current_dir(&container.runtime_dir);

    let terminal = container
        .spec()
        .process()
        .as_ref()
        .and_then(|process| process.terminal())
        .unwrap_or(false);

    let child = match &container.config.console_socket {
        Some(socket) => spawn_with_console(ctx, command, socket)?,
        None if terminal => {
            // the engine replaces the init's stdio with its own PTY; the
            // monitor itself needs none
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            spawn(command)?
        }
        None => spawn(command)?,
    };

    Ok(child.id() as i32)
}

fn spawn(mut command: Command) -> Result<Child> {
    command
        .spawn()
        .map_err(|err| Error::system("failed to start monitor process", err))
}

/// Dials the console socket, spawns the monitor as session leader on a
/// new PTY and sends the master fd to the socket peer.
fn spawn_with_console(ctx: &Context, mut command: Command, socket: &Path) -> Result<Child> {
    let stream = UnixStream::connect(socket).map_err(|err| {
        Error::system(
            format!("connecting to console socket {} failed", socket.display()),
            err,
        )
    })?;
    if ctx.deadline().is_some() {
        stream
            .set_write_timeout(ctx.remaining())
            .map_err(|err| Error::system("failed to set console socket deadline", err))?;
    }

    let pty = nix::pty::openpty(None, None)
        .map_err(|err| Error::system("failed to open pty", std::io::Error::from(err)))?;
    let child = spawn_on_pty(command, pty.slave)?;

    send_pty_master(&stream, pty.master)?;
    Ok(child)
}

fn spawn_on_pty(mut command: Command, slave: OwnedFd) -> Result<Child> {
    let stdio = |fd: &OwnedFd| -> Result<Stdio> {
        Ok(Stdio::from(fd.try_clone().map_err(|err| {
            Error::system("failed to duplicate pty slave", err)
        })?))
    };
    command
        .stdin(stdio(&slave)?)
        .stdout(stdio(&slave)?)
        .stderr(stdio(&slave)?);
    unsafe {
        command.pre_exec(|| {
            // become session leader and take the pty as controlling
            // terminal
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    spawn(command)
}

/// A single message with the body "terminal" and the master fd as
/// `SCM_RIGHTS` ancillary data.
fn send_pty_master(stream: &UnixStream, master: OwnedFd) -> Result<()> {
    let iov = [IoSlice::new(b"terminal")];
    let fds = [master.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    socket::sendmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &iov,
        &cmsg,
        MsgFlags::empty(),
        None,
    )
    .map_err(|err| {
        Error::system(
            "failed to send pty master over console socket",
            std::io::Error::from(err),
        )
    })?;
    // the receiver owns the terminal now
    drop(master);
    Ok(())
}
