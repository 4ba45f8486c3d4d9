//! Raw, hand-maintained bindings to liblxc's public container API
//! (`lxc/lxccontainer.h`). Only the subset of the API that the runtime
//! uses is exercised; the full method table is declared so that field
//! offsets match the installed library.
//!
//! All containers are handled through pointers obtained from
//! [`lxc_container_new`]; the struct is never constructed or moved by
//! value on the Rust side.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uint, c_ulong, c_void, pid_t};

pub enum lxc_lock {}
pub enum lxc_conf {}
pub enum bdev_specs {}
pub enum lxc_snapshot {}
pub enum migrate_opts {}
pub enum lxc_console_log {}
pub enum lxc_mount {}
pub enum lxc_attach_options_t {}

pub type lxc_attach_exec_t =
    Option<unsafe extern "C" fn(payload: *mut c_void) -> c_int>;

#[repr(C)]
pub struct lxc_container {
    pub name: *mut c_char,
    pub configfile: *mut c_char,
    pub pidfile: *mut c_char,
    pub slock: *mut lxc_lock,
    pub privlock: *mut lxc_lock,
    pub numthreads: c_int,
    pub lxc_conf: *mut lxc_conf,

    pub error_string: *mut c_char,
    pub error_num: c_int,
    pub daemonize: bool,
    pub config_path: *mut c_char,

    pub is_defined: Option<unsafe extern "C" fn(c: *mut lxc_container) -> bool>,
    pub state: Option<unsafe extern "C" fn(c: *mut lxc_container) -> *const c_char>,
    pub is_running: Option<unsafe extern "C" fn(c: *mut lxc_container) -> bool>,
    pub freeze: Option<unsafe extern "C" fn(c: *mut lxc_container) -> bool>,
    pub unfreeze: Option<unsafe extern "C" fn(c: *mut lxc_container) -> bool>,
    pub init_pid: Option<unsafe extern "C" fn(c: *mut lxc_container) -> pid_t>,
    pub load_config:
        Option<unsafe extern "C" fn(c: *mut lxc_container, alt_file: *const c_char) -> bool>,
    pub start: Option<
        unsafe extern "C" fn(c: *mut lxc_container, useinit: c_int, argv: *const *mut c_char) -> bool,
    >,
    pub startl: Option<unsafe extern "C" fn(c: *mut lxc_container, useinit: c_int, ...) -> bool>,
    pub stop: Option<unsafe extern "C" fn(c: *mut lxc_container) -> bool>,
    pub want_daemonize: Option<unsafe extern "C" fn(c: *mut lxc_container, state: bool) -> bool>,
    pub want_close_all_fds:
        Option<unsafe extern "C" fn(c: *mut lxc_container, state: bool) -> bool>,
    pub config_file_name: Option<unsafe extern "C" fn(c: *mut lxc_container) -> *mut c_char>,
    pub wait: Option<
        unsafe extern "C" fn(c: *mut lxc_container, state: *const c_char, timeout: c_int) -> bool,
    >,
    pub set_config_item: Option<
        unsafe extern "C" fn(c: *mut lxc_container, key: *const c_char, value: *const c_char) -> bool,
    >,
    pub destroy: Option<unsafe extern "C" fn(c: *mut lxc_container) -> bool>,
    pub save_config:
        Option<unsafe extern "C" fn(c: *mut lxc_container, alt_file: *const c_char) -> bool>,
    pub create: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            t: *const c_char,
            bdevtype: *const c_char,
            specs: *mut bdev_specs,
            flags: c_int,
            argv: *const *mut c_char,
        ) -> bool,
    >,
    pub createl: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            t: *const c_char,
            bdevtype: *const c_char,
            specs: *mut bdev_specs,
            flags: c_int,
            ...
        ) -> bool,
    >,
    pub rename:
        Option<unsafe extern "C" fn(c: *mut lxc_container, newname: *const c_char) -> bool>,
    pub reboot: Option<unsafe extern "C" fn(c: *mut lxc_container) -> bool>,
    pub shutdown: Option<unsafe extern "C" fn(c: *mut lxc_container, timeout: c_int) -> bool>,
    pub clear_config: Option<unsafe extern "C" fn(c: *mut lxc_container)>,
    pub clear_config_item:
        Option<unsafe extern "C" fn(c: *mut lxc_container, key: *const c_char) -> bool>,
    pub get_config_item: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            key: *const c_char,
            retv: *mut c_char,
            inlen: c_int,
        ) -> c_int,
    >,
    pub get_running_config_item:
        Option<unsafe extern "C" fn(c: *mut lxc_container, key: *const c_char) -> *mut c_char>,
    pub get_keys: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            key: *const c_char,
            retv: *mut c_char,
            inlen: c_int,
        ) -> c_int,
    >,
    pub get_interfaces:
        Option<unsafe extern "C" fn(c: *mut lxc_container) -> *mut *mut c_char>,
    pub get_ips: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            interface: *const c_char,
            family: *const c_char,
            scope: c_int,
        ) -> *mut *mut c_char,
    >,
    pub get_cgroup_item: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            subsys: *const c_char,
            retv: *mut c_char,
            inlen: c_int,
        ) -> c_int,
    >,
    pub set_cgroup_item: Option<
        unsafe extern "C" fn(c: *mut lxc_container, subsys: *const c_char, value: *const c_char) -> bool,
    >,
    pub get_config_path:
        Option<unsafe extern "C" fn(c: *mut lxc_container) -> *const c_char>,
    pub set_config_path:
        Option<unsafe extern "C" fn(c: *mut lxc_container, path: *const c_char) -> bool>,
    pub clone: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            newname: *const c_char,
            lxcpath: *const c_char,
            flags: c_int,
            bdevtype: *const c_char,
            bdevdata: *const c_char,
            newsize: u64,
            hookargs: *mut *mut c_char,
        ) -> *mut lxc_container,
    >,
    pub console_getfd: Option<
        unsafe extern "C" fn(c: *mut lxc_container, ttynum: *mut c_int, masterfd: *mut c_int) -> c_int,
    >,
    pub console: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            ttynum: c_int,
            stdinfd: c_int,
            stdoutfd: c_int,
            stderrfd: c_int,
            escape: c_int,
        ) -> c_int,
    >,
    pub attach: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            exec_function: lxc_attach_exec_t,
            exec_payload: *mut c_void,
            options: *mut lxc_attach_options_t,
            attached_process: *mut pid_t,
        ) -> c_int,
    >,
    pub attach_run_wait: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            options: *mut lxc_attach_options_t,
            program: *const c_char,
            argv: *const *const c_char,
        ) -> c_int,
    >,
    pub attach_run_waitl: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            options: *mut lxc_attach_options_t,
            program: *const c_char,
            arg: *const c_char,
            ...
        ) -> c_int,
    >,
    pub snapshot:
        Option<unsafe extern "C" fn(c: *mut lxc_container, commentfile: *const c_char) -> c_int>,
    pub snapshot_list: Option<
        unsafe extern "C" fn(c: *mut lxc_container, snapshots: *mut *mut lxc_snapshot) -> c_int,
    >,
    pub snapshot_restore: Option<
        unsafe extern "C" fn(c: *mut lxc_container, snapname: *const c_char, newname: *const c_char) -> bool,
    >,
    pub snapshot_destroy:
        Option<unsafe extern "C" fn(c: *mut lxc_container, snapname: *const c_char) -> bool>,
    pub may_control: Option<unsafe extern "C" fn(c: *mut lxc_container) -> bool>,
    pub add_device_node: Option<
        unsafe extern "C" fn(c: *mut lxc_container, src_path: *const c_char, dest_path: *const c_char) -> bool,
    >,
    pub remove_device_node: Option<
        unsafe extern "C" fn(c: *mut lxc_container, src_path: *const c_char, dest_path: *const c_char) -> bool,
    >,
    pub attach_interface: Option<
        unsafe extern "C" fn(c: *mut lxc_container, dev: *const c_char, dst_dev: *const c_char) -> bool,
    >,
    pub detach_interface: Option<
        unsafe extern "C" fn(c: *mut lxc_container, dev: *const c_char, dst_dev: *const c_char) -> bool,
    >,
    pub checkpoint: Option<
        unsafe extern "C" fn(c: *mut lxc_container, directory: *mut c_char, stop: bool, verbose: bool) -> bool,
    >,
    pub restore: Option<
        unsafe extern "C" fn(c: *mut lxc_container, directory: *mut c_char, verbose: bool) -> bool,
    >,
    pub destroy_with_snapshots: Option<unsafe extern "C" fn(c: *mut lxc_container) -> bool>,
    pub snapshot_destroy_all: Option<unsafe extern "C" fn(c: *mut lxc_container) -> bool>,
    pub migrate: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            cmd: c_uint,
            opts: *mut migrate_opts,
            size: c_uint,
        ) -> c_int,
    >,
    pub console_log:
        Option<unsafe extern "C" fn(c: *mut lxc_container, log: *mut lxc_console_log) -> c_int>,
    pub reboot2: Option<unsafe extern "C" fn(c: *mut lxc_container, timeout: c_int) -> bool>,
    pub mount: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            source: *const c_char,
            target: *const c_char,
            filesystemtype: *const c_char,
            mountflags: c_ulong,
            data: *const c_void,
            mnt: *mut lxc_mount,
        ) -> c_int,
    >,
    pub umount: Option<
        unsafe extern "C" fn(
            c: *mut lxc_container,
            target: *const c_char,
            mountflags: c_ulong,
            mnt: *mut lxc_mount,
        ) -> c_int,
    >,
    pub seccomp_notify_fd: Option<unsafe extern "C" fn(c: *mut lxc_container) -> c_int>,
    pub seccomp_notify_fd_active: Option<unsafe extern "C" fn(c: *mut lxc_container) -> c_int>,
    pub init_pidfd: Option<unsafe extern "C" fn(c: *mut lxc_container) -> c_int>,
    pub devpts_fd: Option<unsafe extern "C" fn(c: *mut lxc_container) -> c_int>,
}

extern "C" {
    pub fn lxc_container_new(
        name: *const c_char,
        configpath: *const c_char,
    ) -> *mut lxc_container;
    pub fn lxc_container_get(c: *mut lxc_container) -> c_int;
    pub fn lxc_container_put(c: *mut lxc_container) -> c_int;
    pub fn lxc_get_wait_states(states: *mut *const c_char) -> c_int;
    pub fn lxc_get_global_config_item(key: *const c_char) -> *const c_char;
    pub fn lxc_get_version() -> *const c_char;
    pub fn lxc_config_item_is_supported(key: *const c_char) -> bool;
    pub fn lxc_has_api_extension(extension: *const c_char) -> bool;
    pub fn list_defined_containers(
        lxcpath: *const c_char,
        names: *mut *mut *mut c_char,
        cret: *mut *mut *mut lxc_container,
    ) -> c_int;
    pub fn list_active_containers(
        lxcpath: *const c_char,
        names: *mut *mut *mut c_char,
        cret: *mut *mut *mut lxc_container,
    ) -> c_int;
    pub fn list_all_containers(
        lxcpath: *const c_char,
        names: *mut *mut *mut c_char,
        cret: *mut *mut *mut lxc_container,
    ) -> c_int;
}
