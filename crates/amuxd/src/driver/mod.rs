//! Backend drivers.
//!
//! A driver owns one agent's terminal: it delivers the agent's output as
//! push events, accepts input and resizes, and reports termination. Two
//! implementations exist behind one per-session contract:
//!
//! - [`pty`] - the agent is a direct child on a supervisor-owned
//!   pseudoterminal. Output and exit arrive as push callbacks from a
//!   blocking reader thread.
//! - [`tmux`] - the agent lives in a detached tmux session that survives
//!   supervisor restarts. Output is polled off a pipe-pane tee file; exit
//!   is detected by a supervisor-wide session-list poll.
//!
//! The backend is selected at startup and never mixed within one
//! supervisor instance.

pub mod pty;
pub mod tmux;

use std::env;

use thiserror::Error;
use tracing::info;

use amux_core::SessionId;

use crate::config::{BackendSelector, SENSITIVE_ENV_VARS};

/// Which backend hosts this supervisor's sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Pty,
    Tmux,
}

impl BackendKind {
    /// Resolves the configured selector. `auto` prefers tmux when the
    /// daemon binary is installed. Explicitly selecting tmux without the
    /// binary present is fatal.
    pub fn resolve(selector: BackendSelector) -> Result<Self, DriverError> {
        match selector {
            BackendSelector::Pty => Ok(Self::Pty),
            BackendSelector::Tmux => {
                if tmux::is_available() {
                    Ok(Self::Tmux)
                } else {
                    Err(DriverError::BackendUnavailable {
                        backend: "tmux".to_string(),
                    })
                }
            }
            BackendSelector::Auto => {
                if tmux::is_available() {
                    info!("tmux detected, using multiplexer backend");
                    Ok(Self::Tmux)
                } else {
                    info!("tmux not found, using direct PTY backend");
                    Ok(Self::Pty)
                }
            }
        }
    }
}

/// Push events produced by drivers and fed back into the supervisor.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Raw output bytes from the agent's terminal, in production order.
    Output { session_id: SessionId, bytes: Vec<u8> },

    /// The agent terminated. The exit code is absent for tmux-hosted
    /// sessions (the multiplexer does not surface it).
    Exited {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
}

/// Builds the child environment: the supervisor's own environment with
/// the sensitive variables removed.
pub fn build_child_env() -> Vec<(String, String)> {
    env::vars()
        .filter(|(key, _)| !SENSITIVE_ENV_VARS.contains(&key.as_str()))
        .collect()
}

/// Errors surfaced by driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("required backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("failed to spawn agent: {reason}")]
    Spawn { reason: String },

    #[error("driver command failed: {reason}")]
    Command { reason: String },

    #[error("driver i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_env_scrubs_sensitive_vars() {
        env::set_var("AMUX_TOKEN", "secret");
        env::set_var("AMUX_ENV_PROBE", "keep-me");

        let child_env = build_child_env();
        assert!(!child_env.iter().any(|(k, _)| k == "AMUX_TOKEN"));
        assert!(child_env
            .iter()
            .any(|(k, v)| k == "AMUX_ENV_PROBE" && v == "keep-me"));

        env::remove_var("AMUX_TOKEN");
        env::remove_var("AMUX_ENV_PROBE");
    }
}
