//! Error types surfaced to pool callers.
//!
//! Every accepted `get` produces exactly one outcome: a session or one of the
//! error kinds below. Failures inside auxiliary machinery (metrics, hook
//! scripts) are logged and never reach this surface.

use std::time::Duration;

/// Why a worker could not be spawned.
///
/// Returned by the spawning kit and wrapped into [`GetError::SpawnFailed`]
/// when a queued request has to be flushed with the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// The start command could not be executed at all.
    Exec(String),
    /// The worker started but reported failure (or exited) before becoming ready.
    Failed(String),
    /// The worker did not become ready within the configured start timeout.
    Timeout { limit: Duration },
    /// The options carried no start command.
    MissingCommand,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Exec(msg) => write!(f, "could not execute start command: {}", msg),
            SpawnError::Failed(msg) => write!(f, "worker failed to start: {}", msg),
            SpawnError::Timeout { limit } => {
                write!(f, "worker did not start within {:?}", limit)
            }
            SpawnError::MissingCommand => write!(f, "no start command configured"),
        }
    }
}

impl std::error::Error for SpawnError {}

/// Error delivered to a `get` caller instead of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetError {
    /// The spawning kit returned a failure; the cause is preserved.
    SpawnFailed(SpawnError),
    /// The group's request queue reached its size bound.
    RequestQueueFull { limit: usize },
    /// The request sat queued longer than its time bound.
    RequestQueueTimeout { waited: Duration },
    /// The group was detached while the request was waiting.
    GroupDetached,
    /// The pool transitioned away from `alive`.
    PoolShuttingDown,
    /// The caller cancelled before a session was assigned.
    GetAborted,
}

impl GetError {
    /// Stable machine-readable name for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            GetError::SpawnFailed(_) => "spawn_failed",
            GetError::RequestQueueFull { .. } => "request_queue_full",
            GetError::RequestQueueTimeout { .. } => "request_queue_timeout",
            GetError::GroupDetached => "group_detached",
            GetError::PoolShuttingDown => "pool_shutting_down",
            GetError::GetAborted => "get_aborted",
        }
    }
}

impl std::fmt::Display for GetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GetError::SpawnFailed(e) => write!(f, "spawn failed: {}", e),
            GetError::RequestQueueFull { limit } => {
                write!(f, "request queue full (limit {})", limit)
            }
            GetError::RequestQueueTimeout { waited } => {
                write!(f, "request queued for {:?} without being assigned", waited)
            }
            GetError::GroupDetached => write!(f, "group was detached"),
            GetError::PoolShuttingDown => write!(f, "pool is shutting down"),
            GetError::GetAborted => write!(f, "request aborted by caller"),
        }
    }
}

impl std::error::Error for GetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GetError::SpawnFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SpawnError> for GetError {
    fn from(err: SpawnError) -> Self {
        GetError::SpawnFailed(err)
    }
}

/// Outcome of a disable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableResult {
    /// The process drained its sessions and is no longer serving.
    Success,
    /// The process died or was detached before draining.
    Canceled,
    /// The process was already detached when disable was requested.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_error_kinds() {
        assert_eq!(GetError::GroupDetached.kind(), "group_detached");
        assert_eq!(GetError::PoolShuttingDown.kind(), "pool_shutting_down");
        assert_eq!(GetError::GetAborted.kind(), "get_aborted");
        assert_eq!(
            GetError::SpawnFailed(SpawnError::MissingCommand).kind(),
            "spawn_failed"
        );
        assert_eq!(GetError::RequestQueueFull { limit: 5 }.kind(), "request_queue_full");
    }

    #[test]
    fn test_spawn_failure_cause_preserved() {
        let err = GetError::from(SpawnError::Failed("exit status 1".to_string()));
        match &err {
            GetError::SpawnFailed(SpawnError::Failed(msg)) => {
                assert_eq!(msg, "exit status 1");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("exit status 1"));
    }

    #[test]
    fn test_queue_timeout_display() {
        let err = GetError::RequestQueueTimeout {
            waited: Duration::from_millis(150),
        };
        assert!(err.to_string().contains("150ms"));
    }
}
