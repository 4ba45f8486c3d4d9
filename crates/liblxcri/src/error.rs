//! Runtime error taxonomy.
//!
//! Nothing is retried inside the library. Partial progress from a failed
//! `create` is always cleanable with `delete(id, force: true)`.

use std::fmt::Display;

use crate::container::ContainerStatus;
use crate::engine::EngineError;

pub type Result<T> = std::result::Result<T, Error>;

/// Host preconditions checked once in [`crate::Runtime::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Procfs,
    CgroupRoot,
    LibexecBinaries,
    EngineVersion,
    RuntimeRoot,
}

impl Display for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Precondition::Procfs => "procfs",
            Precondition::CgroupRoot => "cgroup2 root",
            Precondition::LibexecBinaries => "libexec binaries",
            Precondition::EngineVersion => "engine version",
            Precondition::RuntimeRoot => "runtime root",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("host precondition failed ({kind}): {reason}")]
    PreconditionFailed { kind: Precondition, reason: String },

    #[error("container does not exist")]
    NotExist,

    #[error("container is {actual}, but the operation requires {required}")]
    IllegalState {
        required: &'static str,
        actual: ContainerStatus,
    },

    #[error("engine failure: {0}")]
    Engine(#[from] EngineError),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    System {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Wraps an unexpected syscall or file error with context.
    pub fn system(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::System {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    pub fn precondition(kind: Precondition, reason: impl Into<String>) -> Self {
        Error::PreconditionFailed {
            kind,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_config("missing process args");
        assert_eq!(err.to_string(), "invalid configuration: missing process args");

        let err = Error::precondition(Precondition::CgroupRoot, "not mounted");
        assert_eq!(
            err.to_string(),
            "host precondition failed (cgroup2 root): not mounted"
        );

        let err = Error::IllegalState {
            required: "created",
            actual: ContainerStatus::Stopped,
        };
        assert_eq!(
            err.to_string(),
            "container is stopped, but the operation requires created"
        );
    }
}
