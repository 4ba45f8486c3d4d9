//! The container monitor: loads the engine config written by the
//! runtime and runs the container in the foreground, supervising its
//! init process until it exits. Exits with the init's status, or kills
//! its own process group with the init's terminating signal.

use std::ffi::CString;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let [_, name, lxcpath, rcfile] = args.as_slice() else {
        eprintln!("[lxcri-start] usage: lxcri-start <container_name> <lxcpath> <config_path>");
        return ExitCode::FAILURE;
    };

    // Drop the controlling terminal so the engine's terminal settings do
    // not swallow the caller's ^C. The error is ignored; stdio may be a
    // PTY set up by the runtime.
    unsafe { libc::setsid() };

    match run(name, lxcpath, rcfile) {
        Ok(code) => code,
        Err(msg) => {
            eprintln!("[lxcri-start] {msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(name: &str, lxcpath: &str, rcfile: &str) -> Result<ExitCode, String> {
    let c_name = CString::new(name).map_err(|_| "invalid container name")?;
    let c_lxcpath = CString::new(lxcpath).map_err(|_| "invalid lxcpath")?;
    let c_rcfile = CString::new(rcfile).map_err(|_| "invalid config path")?;

    let container = unsafe { lxc_sys::lxc_container_new(c_name.as_ptr(), c_lxcpath.as_ptr()) };
    if container.is_null() {
        return Err("failed to create new container".into());
    }

    let result = unsafe {
        let c = &*container;

        if let Some(clear_config) = c.clear_config {
            clear_config(container);
        }
        let load_config = c.load_config.ok_or("liblxc without load_config")?;
        if !load_config(container, c_rcfile.as_ptr()) {
            Err(format!("failed to load container config {rcfile}"))
        } else {
            // daemonizing would null the inherited stdio
            (*container).daemonize = false;

            let start = c.start.ok_or("liblxc without start")?;
            if !start(container, 0, std::ptr::null()) {
                Err("failed to start container".to_string())
            } else {
                Ok(exit_status((*container).error_num))
            }
        }
    };

    unsafe { lxc_sys::lxc_container_put(container) };
    result
}

/// Propagates the init's exit: re-raise its terminating signal against
/// our process group, otherwise forward the exit status.
fn exit_status(error_num: i32) -> ExitCode {
    if libc::WIFSIGNALED(error_num) {
        unsafe { libc::kill(0, libc::WTERMSIG(error_num)) };
    }
    if libc::WIFEXITED(error_num) {
        return ExitCode::from(libc::WEXITSTATUS(error_num) as u8);
    }
    ExitCode::SUCCESS
}
