//! Supervisor actor commands, errors, and events.
//!
//! Message types for communicating with the `SupervisorActor`:
//! - `SupervisorCommand`: commands sent to the actor (public operations
//!   plus internal driver/timer re-entry variants)
//! - `SupervisorError`: caller-observable failures
//! - `SessionEvent`: events published for subscribers

use std::collections::HashSet;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use amux_core::{
    DetailedState, DomainError, SessionDescriptor, SessionId, TranscriptEntry,
};

use crate::driver::DriverEvent;

/// Options for spawning one agent session.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Human name; auto-assigned from the monotonic counter when absent.
    pub name: Option<String>,
    /// Group label; defaults to the sentinel group.
    pub group: Option<String>,
    /// Absolute working directory; must exist and be a directory.
    pub cwd: PathBuf,
    /// Agent argv, vetted against the allow-list.
    pub args: Vec<String>,
    pub cols: Option<f64>,
    pub rows: Option<f64>,
    /// First user message, auto-injected on the first idle transition.
    pub task: Option<String>,
    /// Overrides the configured skip-permissions default when set.
    pub skip_permissions: Option<bool>,
}

/// Accumulated per-state time plus the elapsed time in the current state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub detailed_state: DetailedState,
    pub total_working_ms: u64,
    pub total_idle_ms: u64,
    pub total_permission_wait_ms: u64,
    pub current_state_ms: u64,
    pub compaction_count: u64,
}

/// Commands sent to the supervisor actor.
///
/// Each public operation carries a oneshot channel for its response.
/// Internal variants re-enter the serialized core from driver readers,
/// idle timers, and the tmux exit poll.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Spawn a new agent session.
    Spawn {
        opts: Box<SpawnOptions>,
        respond_to: oneshot::Sender<Result<SessionDescriptor, SupervisorError>>,
    },

    /// Inject input bytes into a running session.
    Write {
        session_id: SessionId,
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },

    /// Resize a running session's terminal. Values are clamped; the
    /// current dimensions serve as fallback for absent or non-finite
    /// inputs.
    Resize {
        session_id: SessionId,
        cols: Option<f64>,
        rows: Option<f64>,
        respond_to: oneshot::Sender<Result<(u16, u16), SupervisorError>>,
    },

    /// Kill a session (or remove an already-exited descriptor).
    /// Responds `false` only when the id is unknown.
    Kill {
        session_id: SessionId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Stop the exit poller, then kill every session.
    KillAll { respond_to: oneshot::Sender<()> },

    /// Get a single descriptor.
    GetSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<Box<SessionDescriptor>>>,
    },

    /// Get all descriptors.
    ListSessions {
        respond_to: oneshot::Sender<Vec<SessionDescriptor>>,
    },

    /// Distinct group labels of live sessions.
    Groups {
        respond_to: oneshot::Sender<Vec<String>>,
    },

    /// Defensive copy of a session's scrollback.
    GetScrollback {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<Vec<u8>>>,
    },

    /// Defensive copy of a session's transcript.
    GetTranscript {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<Vec<TranscriptEntry>>>,
    },

    /// Per-state time accounting.
    GetMetrics {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<SessionMetrics>>,
    },

    /// Number of sessions in the store.
    Count { respond_to: oneshot::Sender<usize> },

    /// Update a session's task and refresh its start timestamp.
    SetTask {
        session_id: SessionId,
        task: String,
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },

    /// Driver push event (output chunk or exit) re-entering the core.
    Driver(DriverEvent),

    /// A 30 s idle timer fired; stale generations are ignored.
    IdleTimeout {
        session_id: SessionId,
        generation: u64,
    },

    /// Result of one tmux exit poll: names currently hosted by the
    /// multiplexer daemon (empty when the daemon is gone).
    ExitSweep { live: HashSet<String> },
}

/// Caller-observable supervisor failures.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("invalid working directory: {path}")]
    InvalidCwd { path: String },

    #[error("argument not allowed: {arg}")]
    DisallowedArg { arg: String },

    #[error("session limit reached (max: {max})")]
    AtCapacity { max: usize },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session not running: {0}")]
    NotRunning(SessionId),

    #[error("driver failure: {0}")]
    Driver(String),

    #[error("response channel closed")]
    ChannelClosed,
}

impl From<DomainError> for SupervisorError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidCwd { path } => Self::InvalidCwd { path },
            DomainError::DisallowedArg { arg } => Self::DisallowedArg { arg },
            DomainError::AtCapacity { max } => Self::AtCapacity { max },
            DomainError::SessionNotFound { session_id } => {
                Self::SessionNotFound(session_id)
            }
            DomainError::InvalidInput { reason } => Self::Driver(reason),
        }
    }
}

/// Events published by the supervisor to subscribers.
///
/// For a given session the sequence is monotone:
/// `Created → (Output | StateChanged)* → Exited`, with nothing emitted
/// after `Exited`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session was spawned.
    Created { descriptor: Box<SessionDescriptor> },

    /// Raw output bytes, in driver production order.
    Output {
        session_id: SessionId,
        bytes: Vec<u8>,
    },

    /// The detector reported a state change.
    StateChanged {
        session_id: SessionId,
        state: DetailedState,
        previous: DetailedState,
    },

    /// The session terminated (naturally or by kill). The exit code is
    /// absent for tmux-hosted sessions.
    Exited {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SupervisorError::AtCapacity { max: 100 };
        assert_eq!(err.to_string(), "session limit reached (max: 100)");

        let err = SupervisorError::SessionNotFound(SessionId::new("ab12cd34"));
        assert_eq!(err.to_string(), "session not found: ab12cd34");

        let err = SupervisorError::DisallowedArg {
            arg: "--exec".to_string(),
        };
        assert_eq!(err.to_string(), "argument not allowed: --exec");
    }

    #[test]
    fn domain_error_conversion() {
        let err: SupervisorError = DomainError::DisallowedArg {
            arg: "-x".to_string(),
        }
        .into();
        assert!(matches!(err, SupervisorError::DisallowedArg { .. }));

        let err: SupervisorError = DomainError::InvalidCwd {
            path: "/missing".to_string(),
        }
        .into();
        assert!(matches!(err, SupervisorError::InvalidCwd { .. }));
    }

    #[tokio::test]
    async fn command_oneshot_pattern() {
        let (tx, rx) = oneshot::channel::<Result<(), SupervisorError>>();
        tokio::spawn(async move {
            tx.send(Ok(())).ok();
        });
        assert!(rx.await.unwrap().is_ok());
    }
}
