//! The seam to the container engine (liblxc).
//!
//! The engine's surface is stringly typed; the translator therefore
//! produces an ordered [`EngineConfig`] record which is emitted to a
//! handle in a single sweep. Everything behind the [`Engine`] and
//! [`EngineHandle`] traits is replaceable, which keeps the translator and
//! the state mapping testable without a live engine.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[cfg(feature = "liblxc")]
pub mod liblxc;
pub mod test;

/// Version floor enforced by `Runtime::init`.
pub const VERSION_FLOOR: EngineVersion = EngineVersion::new(3, 1, 0);
/// Versions below this are accepted with a warning.
pub const VERSION_RECOMMENDED: EngineVersion = EngineVersion::new(4, 0, 5);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine backend is not compiled in (build with the 'liblxc' feature)")]
    BackendUnavailable,

    #[error("failed to create engine container {name:?}")]
    NewContainer { name: String },

    #[error("failed to set config item '{key}={value}'")]
    SetConfigItem { key: String, value: String },

    #[error("failed to save engine config to {path:?}")]
    SaveConfig { path: PathBuf },

    #[error("failed to load engine config from {path:?}")]
    LoadConfig { path: PathBuf },

    #[error("unsupported engine state {state:?}")]
    UnsupportedState { state: String },

    #[error("engine version {version} is invalid")]
    InvalidVersion { version: String },

    #[error("cgroup {path:?} already contains processes")]
    CgroupNotEmpty { path: PathBuf },

    #[error("the monitor process died before the container was created")]
    MonitorDied,

    #[error("failed to destroy engine container")]
    Destroy,
}

/// States reported by the engine for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Aborting,
    Freezing,
    Frozen,
    Thawed,
}

impl EngineState {
    pub const ALL: [EngineState; 8] = [
        EngineState::Stopped,
        EngineState::Starting,
        EngineState::Running,
        EngineState::Stopping,
        EngineState::Aborting,
        EngineState::Freezing,
        EngineState::Frozen,
        EngineState::Thawed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Stopped => "STOPPED",
            EngineState::Starting => "STARTING",
            EngineState::Running => "RUNNING",
            EngineState::Stopping => "STOPPING",
            EngineState::Aborting => "ABORTING",
            EngineState::Freezing => "FREEZING",
            EngineState::Frozen => "FROZEN",
            EngineState::Thawed => "THAWED",
        }
    }
}

impl Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EngineState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| EngineError::UnsupportedState {
                state: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        EngineVersion {
            major,
            minor,
            patch,
        }
    }

    pub fn at_least(&self, other: EngineVersion) -> bool {
        *self >= other
    }
}

impl Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for EngineVersion {
    type Err = EngineError;

    /// Parses a dotted version, tolerating a devel suffix such as
    /// "5.0.0~git2209".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidVersion {
            version: s.to_string(),
        };
        let mut parts = s.split('.');
        let mut next = |last: bool| -> Result<u32, EngineError> {
            let part = parts.next().ok_or_else(invalid)?;
            let digits = if last {
                part.split(|c: char| !c.is_ascii_digit()).next().unwrap_or("")
            } else {
                part
            };
            digits.parse().map_err(|_| invalid())
        };
        Ok(EngineVersion {
            major: next(false)?,
            minor: next(false)?,
            patch: next(true)?,
        })
    }
}

/// A single engine configuration setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigItem {
    pub key: String,
    pub value: String,
}

/// Ordered record of engine settings produced by the spec translator.
///
/// Items are emitted to the handle in insertion order; keys may repeat
/// (e.g. `lxc.mount.entry`), which appends on the engine side.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    items: Vec<ConfigItem>,
}

impl EngineConfig {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.items.push(ConfigItem {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Last value set for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .rev()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }

    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.items
            .iter()
            .filter(move |item| item.key == key)
            .map(|item| item.value.as_str())
    }

    pub fn items(&self) -> &[ConfigItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Emits all items to the handle in one ordered sweep.
    pub fn apply(&self, handle: &mut dyn EngineHandle) -> Result<(), EngineError> {
        for item in &self.items {
            handle.set_config_item(&item.key, &item.value)?;
            tracing::debug!(key = %item.key, value = %item.value, "set config item");
        }
        Ok(())
    }
}

/// Factory for engine container handles.
pub trait Engine: Send + Sync {
    fn version(&self) -> Result<EngineVersion, EngineError>;

    /// Whether the installed engine knows the given config key.
    fn supports_config_item(&self, key: &str) -> bool;

    /// Creates a handle for the container `name`, rooted at `lxcpath`
    /// (the parent directory of the container runtime directory).
    fn new_handle(&self, name: &str, lxcpath: &Path) -> Result<Box<dyn EngineHandle>, EngineError>;
}

/// A per-container engine handle.
///
/// The handle is owned by the container for its whole lifecycle and must
/// be released explicitly; dropping it without `release` leaks engine
/// resources.
pub trait EngineHandle: std::fmt::Debug + Send {
    fn set_config_item(&mut self, key: &str, value: &str) -> Result<(), EngineError>;

    fn get_config_item(&self, key: &str) -> Option<String>;

    fn save_config(&mut self, path: &Path) -> Result<(), EngineError>;

    fn load_config(&mut self, path: &Path) -> Result<(), EngineError>;

    fn state(&self) -> Result<EngineState, EngineError>;

    /// PID of the container init process, if the engine knows one.
    fn init_pid(&self) -> Option<i32>;

    /// Removes engine-side resources of the container.
    fn destroy(&mut self) -> Result<(), EngineError>;

    fn release(self: Box<Self>) -> Result<(), EngineError>;
}

/// Returns the production engine backend.
pub fn default_engine() -> Result<Box<dyn Engine>, EngineError> {
    #[cfg(feature = "liblxc")]
    {
        Ok(Box::new(liblxc::LxcEngine::new()))
    }
    #[cfg(not(feature = "liblxc"))]
    {
        Err(EngineError::BackendUnavailable)
    }
}
