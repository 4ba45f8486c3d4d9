//! Container status derivation.
//!
//! The OCI status is never persisted; it is always computed from the
//! engine's reported state plus a probe of the init process. Storing it
//! would invite stale-status bugs.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::EngineState;

/// Exact argv[0] of the init process while it still waits on the sync
/// FIFO (NUL terminated in /proc/<pid>/cmdline).
pub const INIT_SENTINEL: &str = "/.lxcri/lxcri-init";

/// OCI container status.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ContainerStatus {
    #[default]
    Creating,
    Created,
    Running,
    Stopped,
}

impl ContainerStatus {
    pub fn can_start(&self) -> bool {
        matches!(self, ContainerStatus::Created)
    }

    pub fn can_kill(&self) -> bool {
        !matches!(self, ContainerStatus::Stopped)
    }

    pub fn can_delete(&self) -> bool {
        matches!(self, ContainerStatus::Stopped)
    }
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContainerStatus::Creating => "creating",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What the `/proc/<pid>/cmdline` probe saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitProbe {
    /// argv[0] is still the init sentinel; the user process has not been
    /// exec'ed yet.
    Sentinel,
    /// The init exec'ed into the user process.
    User,
    /// The process is gone (ENOENT or ESRCH), or the engine knows no
    /// init PID.
    Gone,
}

/// Maps the engine state and the init probe to the OCI status. Total over
/// both inputs.
pub fn derive_status(engine_state: EngineState, init: InitProbe) -> ContainerStatus {
    match engine_state {
        EngineState::Stopped => ContainerStatus::Stopped,
        EngineState::Starting => ContainerStatus::Creating,
        EngineState::Running
        | EngineState::Stopping
        | EngineState::Aborting
        | EngineState::Freezing
        | EngineState::Frozen
        | EngineState::Thawed => match init {
            InitProbe::Sentinel => ContainerStatus::Created,
            InitProbe::User => ContainerStatus::Running,
            InitProbe::Gone => ContainerStatus::Stopped,
        },
    }
}

/// Probes `/proc/<pid>/cmdline` of the init process.
///
/// Read errors are not distinguished: ENOENT is the common case, but the
/// process may also die while its proc directory is open, which surfaces
/// as ESRCH.
pub fn probe_init(init_pid: Option<i32>) -> InitProbe {
    let Some(pid) = init_pid else {
        return InitProbe::Gone;
    };
    if pid < 1 {
        return InitProbe::Gone;
    }
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(cmdline) => {
            let mut sentinel = INIT_SENTINEL.as_bytes().to_vec();
            sentinel.push(0);
            if cmdline == sentinel {
                InitProbe::Sentinel
            } else {
                InitProbe::User
            }
        }
        Err(_) => InitProbe::Gone,
    }
}

/// OCI state document, as emitted by the `state` verb and piped into
/// hooks.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciState {
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub bundle: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Runtime view of a container: the raw engine state next to the derived
/// OCI state.
#[derive(Serialize, Debug, Clone)]
pub struct State {
    pub engine_state: EngineState,
    pub runtime_dir: PathBuf,
    pub oci: OciState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_gates() {
        assert!(ContainerStatus::Created.can_start());
        assert!(!ContainerStatus::Running.can_start());
        assert!(!ContainerStatus::Stopped.can_kill());
        assert!(ContainerStatus::Running.can_kill());
        assert!(ContainerStatus::Creating.can_kill());
        assert!(ContainerStatus::Stopped.can_delete());
        assert!(!ContainerStatus::Created.can_delete());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ContainerStatus::Created).unwrap();
        assert_eq!(json, "\"created\"");
        assert_eq!(ContainerStatus::Running.to_string(), "running");
    }

    // The mapping must be defined for every (engine state, probe) pair.
    #[test]
    fn test_status_mapping_total() {
        let probes = [InitProbe::Sentinel, InitProbe::User, InitProbe::Gone];
        for state in EngineState::ALL {
            for probe in probes {
                let status = derive_status(state, probe);
                match state {
                    EngineState::Stopped => assert_eq!(status, ContainerStatus::Stopped),
                    EngineState::Starting => assert_eq!(status, ContainerStatus::Creating),
                    _ => match probe {
                        InitProbe::Sentinel => assert_eq!(status, ContainerStatus::Created),
                        InitProbe::User => assert_eq!(status, ContainerStatus::Running),
                        InitProbe::Gone => assert_eq!(status, ContainerStatus::Stopped),
                    },
                }
            }
        }
    }

    #[test]
    fn test_probe_self_is_user_process() {
        // our own cmdline is not the init sentinel
        let pid = std::process::id() as i32;
        assert_eq!(probe_init(Some(pid)), InitProbe::User);
    }

    #[test]
    fn test_probe_dead_or_invalid_pid() {
        assert_eq!(probe_init(None), InitProbe::Gone);
        assert_eq!(probe_init(Some(0)), InitProbe::Gone);
        assert_eq!(probe_init(Some(-1)), InitProbe::Gone);
        // PID from the far end of the pid space is almost surely unused
        assert_eq!(probe_init(Some(i32::MAX - 7)), InitProbe::Gone);
    }
}
