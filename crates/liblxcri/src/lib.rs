//! An OCI container runtime built on top of the liblxc engine.
//!
//! The runtime translates an OCI bundle into engine configuration, starts
//! an out-of-process monitor (`lxcri-start`) and coordinates the OCI
//! `create`/`start` split through a synchronization FIFO that the
//! container init process (`lxcri-init`) blocks on.
//!
//! [`Runtime`] is the entry point: it owns the process-wide configuration
//! and routes the lifecycle verbs to per-instance [`container::Container`]
//! values. All mutable state lives in the per-container runtime directory,
//! so operations on distinct containers are independent.

pub mod bundle;
pub mod cgroup;
pub mod container;
pub mod context;
mod create;
pub mod devices;
pub mod engine;
pub mod error;
pub mod hooks;
mod monitor;
pub mod seccomp;
pub mod signal;
mod translate;
pub mod utils;

mod runtime;

pub use container::{Container, ContainerConfig};
pub use context::Context;
pub use create::{CreateError, CONFIG_FILE_ANNOTATION};
pub use error::{Error, Result};
pub use runtime::{Features, Runtime, EXEC_HOOK, EXEC_INIT, EXEC_START};
