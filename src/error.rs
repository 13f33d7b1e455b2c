//! Error taxonomy for the translation engine.
//!
//! Client errors (invalid spec, conflicts) are rejected before any cluster
//! call is made. Operational failures carry the container id and phase so a
//! caller can tell an invalid request apart from an unhealthy cluster.

use std::time::Duration;

/// Errors surfaced by the container backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The container specification is invalid; rejected before any
    /// orchestrator call.
    #[error("invalid container spec: {reason}")]
    InvalidSpec {
        /// What was wrong with the spec.
        reason: String,
    },

    /// No container, network or exec session with the given id.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Resource kind ("container", "network", "exec").
        kind: &'static str,
        /// The id that failed to resolve.
        id: String,
    },

    /// A start is already in flight for this container id.
    #[error("container {id} is already starting")]
    AlreadyStarting {
        /// The contested container id.
        id: String,
    },

    /// The requested alias is already held by another container in the
    /// same network.
    #[error("alias {alias} already in use in network {network}")]
    AliasConflict {
        /// The contested alias.
        alias: String,
        /// Network in which the conflict occurred.
        network: String,
    },

    /// The workload did not reach a ready state within the start timeout.
    #[error("container {id} did not start within {timeout:?}")]
    StartTimeout {
        /// The container that timed out.
        id: String,
        /// The configured timeout that expired.
        timeout: Duration,
    },

    /// A mount cannot be injected pre-start and no post-start copy path
    /// is available.
    #[error("mount for {target} exceeds the injectable size and post-start copy is disabled")]
    MountTooLarge {
        /// Target path of the offending mount.
        target: String,
    },

    /// Exec was requested against a container that is not running.
    #[error("container {id} is not running")]
    NotRunning {
        /// The container id.
        id: String,
    },

    /// A port mapping was queried before the workload reported ready.
    #[error("container {id} is not ready, no endpoint for port {port} yet")]
    NotReady {
        /// The container id.
        id: String,
        /// The declared container port that was looked up.
        port: u16,
    },

    /// The cancellation signal fired while an operation was in flight.
    #[error("operation on container {id} was cancelled")]
    Cancelled {
        /// The container id.
        id: String,
    },

    /// An orchestrator call failed after retries were exhausted, or failed
    /// with a non-retryable error.
    #[error("orchestrator error during {phase} for container {id}: {source}")]
    Orchestrator {
        /// The container the operation was acting on.
        id: String,
        /// Lifecycle phase during which the failure occurred.
        phase: &'static str,
        /// The underlying cluster error.
        source: OrchestratorError,
    },
}

impl Error {
    /// Wraps an orchestrator error with container and phase context.
    pub fn orchestrator(id: impl Into<String>, phase: &'static str, source: OrchestratorError) -> Self {
        Self::Orchestrator {
            id: id.into(),
            phase,
            source,
        }
    }
}

/// Failure of a single call against the cluster orchestrator.
///
/// Transient failures (throttling, api-server hiccups) are retried with
/// bounded backoff by the lifecycle controller and never surfaced unless
/// retries are exhausted; fatal failures surface immediately.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Retryable failure, e.g. throttling or a 5xx from the api-server.
    #[error("transient orchestrator failure: {reason}")]
    Transient {
        /// Description of the failure.
        reason: String,
    },

    /// Non-retryable failure, e.g. resource validation rejected.
    #[error("orchestrator failure: {reason}")]
    Fatal {
        /// Description of the failure.
        reason: String,
    },
}

impl OrchestratorError {
    /// Creates a transient (retryable) error.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Creates a fatal (non-retryable) error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Returns true if the failure is worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
