//! Error taxonomy of the container lifecycle.
//!
//! Each operation has its own enum so callers can match on exactly the
//! failures that operation can produce. OS-level causes are carried as
//! [`RunfError`] sources.

use std::fmt;
use std::path::PathBuf;

use runf_common::error::RunfError;
use runf_common::types::{ContainerId, ContainerState};
use runf_core::spec::ValidationError;
use thiserror::Error;

use crate::handshake::{HandshakeError, InitStage};

/// Failure of [`crate::factory::ContainerFactory::create`].
///
/// Nothing created before the failure survives it.
#[derive(Debug, Error)]
pub enum CreateError {
    /// The container identifier is unusable.
    #[error("invalid container id: {source}")]
    InvalidId {
        /// Why the identifier was rejected.
        source: RunfError,
    },

    /// The isolation spec breaks a structural rule.
    #[error("invalid isolation spec: {0}")]
    InvalidSpec(#[from] ValidationError),

    /// The root filesystem does not exist.
    #[error("rootfs {path} does not exist")]
    RootfsNotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// A container with this identifier already exists.
    #[error("container {id} already exists")]
    AlreadyExists {
        /// The conflicting identifier.
        id: ContainerId,
    },

    /// The ID mappings are not covered by the invoking user's delegation.
    #[error("ID mappings not permitted: {source}")]
    SubordinateIds {
        /// Lookup or coverage failure.
        source: RunfError,
    },

    /// The work directory or state file could not be written.
    #[error("failed to provision work directory: {source}")]
    WorkDir {
        /// Underlying error.
        source: RunfError,
    },

    /// The cgroup could not be created or configured.
    #[error("failed to provision cgroup: {source}")]
    Cgroup {
        /// Underlying error.
        source: RunfError,
    },
}

/// Failure of [`crate::container::Container::run`].
///
/// By the time a `RunError` is returned the container has been destroyed.
#[derive(Debug, Error)]
pub enum RunError {
    /// The container was already destroyed.
    #[error("container has been destroyed")]
    AlreadyDestroyed,

    /// The container already ran a process.
    #[error("container is {state}, expected created")]
    InvalidState {
        /// Current state.
        state: ContainerState,
    },

    /// The process description is unusable.
    #[error("invalid process: {source}")]
    InvalidProcess {
        /// Why it was rejected.
        source: RunfError,
    },

    /// The init process could not be started.
    #[error("failed to spawn init process: {source}")]
    Spawn {
        /// Underlying error.
        source: RunfError,
    },

    /// The sync channel broke or the protocol was violated.
    #[error(transparent)]
    Channel(#[from] HandshakeError),

    /// Host-side setup for the init process failed.
    #[error("host-side setup failed: {source}")]
    Setup {
        /// Underlying error.
        source: RunfError,
    },

    /// Init could not prepare the container's filesystem.
    #[error("mount failed: {message}")]
    Mount {
        /// Description reported by init.
        message: String,
    },

    /// Init reported a failure in another stage.
    #[error("init failed during {stage}: {message}")]
    Init {
        /// The failing stage.
        stage: InitStage,
        /// Description reported by init.
        message: String,
    },

    /// Init exited without reporting readiness or an error.
    #[error("init process exited before it was ready")]
    InitExited,

    /// The target command could not be executed.
    #[error("exec failed: {message}")]
    Exec {
        /// Description reported by init.
        message: String,
    },
}

impl RunError {
    /// Maps an error reported by init onto the matching variant.
    #[must_use]
    pub fn from_init(stage: InitStage, message: String) -> Self {
        match stage {
            InitStage::Rootfs => Self::Mount { message },
            InitStage::Exec => Self::Exec { message },
            _ => Self::Init { stage, message },
        }
    }
}

/// Failure of [`crate::container::Container::wait`].
#[derive(Debug, Error)]
pub enum WaitError {
    /// The process does not belong to a running container.
    #[error("container is {state}, not running this process")]
    NotRunning {
        /// Current state.
        state: ContainerState,
    },

    /// Waiting on the init process failed.
    #[error("failed to wait for init process: {source}")]
    Wait {
        /// Underlying error.
        source: RunfError,
    },
}

/// Every cleanup step of [`crate::container::Container::destroy`] that failed.
///
/// Destroy keeps going past a failed step, so this can hold several causes.
#[derive(Debug, Error)]
pub struct DestroyError {
    /// The failed steps, in the order they ran.
    pub failures: Vec<RunfError>,
}

impl fmt::Display for DestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "destroy left {} step(s) unfinished", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

/// Failure of the init entry point. The init process exits with status 1.
#[derive(Debug, Error)]
pub enum StartInitializationError {
    /// A setup stage failed.
    #[error("init failed during {stage}: {source}")]
    Stage {
        /// The failing stage.
        stage: InitStage,
        /// Underlying error.
        source: RunfError,
    },

    /// The sync channel broke or the protocol was violated.
    #[error(transparent)]
    Channel(#[from] HandshakeError),

    /// More than one thread exists, so namespace-scoped calls are unsafe.
    #[error("init process has {0} threads, expected exactly one")]
    NotSingleThreaded(usize),

    /// The sync socket descriptor was not passed in the environment.
    #[error("sync descriptor missing or invalid in environment")]
    MissingSyncFd,
}

impl StartInitializationError {
    /// The stage to report to the driver.
    #[must_use]
    pub const fn stage(&self) -> InitStage {
        match self {
            Self::Stage { stage, .. } => *stage,
            _ => InitStage::Handshake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rootfs_failures_surface_as_mount_errors() {
        let err = RunError::from_init(InitStage::Rootfs, "unsupported device type".into());
        assert!(matches!(err, RunError::Mount { .. }));

        let err = RunError::from_init(InitStage::Namespaces, "denied".into());
        assert!(matches!(err, RunError::Init { stage: InitStage::Namespaces, .. }));
    }

    #[test]
    fn destroy_error_lists_every_failure() {
        let err = DestroyError {
            failures: vec![
                RunfError::Config { message: "one".into() },
                RunfError::Config { message: "two".into() },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("destroy left 2 step(s) unfinished"));
        assert!(text.contains("one") && text.contains("two"));
    }
}
