//! Frame types for the streaming surface.

use amux_core::{DetailedState, SessionDescriptor, SessionId};
use serde::{Deserialize, Serialize};

/// Largest input payload a client may inject per frame. Oversized frames
/// are rejected silently.
pub const MAX_INPUT_BYTES: usize = 65_536;

/// Frames sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Subscribe to a session's output, optionally resizing its terminal
    /// before the scrollback snapshot is delivered.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        session_id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        cols: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<f64>,
    },

    /// Stop receiving output for a session.
    #[serde(rename_all = "camelCase")]
    Unsubscribe { session_id: SessionId },

    /// Inject keystrokes into a session.
    #[serde(rename_all = "camelCase")]
    Input { session_id: SessionId, data: String },

    /// Resize a session's terminal.
    #[serde(rename_all = "camelCase")]
    Resize {
        session_id: SessionId,
        cols: f64,
        rows: f64,
    },
}

/// Frames sent by the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonFrame {
    /// Full session list, delivered on connect.
    #[serde(rename = "sessions")]
    Sessions { sessions: Vec<SessionDescriptor> },

    /// Concatenated scrollback snapshot, delivered once per subscribe
    /// before any live output.
    #[serde(rename = "scrollback", rename_all = "camelCase")]
    Scrollback { session_id: SessionId, data: String },

    /// Coalesced live output for one session.
    #[serde(rename = "output", rename_all = "camelCase")]
    Output { session_id: SessionId, data: String },

    /// A session was spawned.
    #[serde(rename = "session:created")]
    SessionCreated { session: Box<SessionDescriptor> },

    /// A session exited or was killed.
    #[serde(rename = "session:exited", rename_all = "camelCase")]
    SessionExited {
        session_id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    /// A session's detailed state changed.
    #[serde(rename = "session:stateChanged", rename_all = "camelCase")]
    SessionStateChanged {
        session_id: SessionId,
        state: DetailedState,
        previous: DetailedState,
    },

    /// Answer to a malformed or failed client frame. Never terminates
    /// the connection.
    #[serde(rename = "error")]
    Error { message: String },
}

impl DaemonFrame {
    pub fn sessions(sessions: Vec<SessionDescriptor>) -> Self {
        Self::Sessions { sessions }
    }

    pub fn scrollback(session_id: SessionId, data: String) -> Self {
        Self::Scrollback { session_id, data }
    }

    pub fn output(session_id: SessionId, data: String) -> Self {
        Self::Output { session_id, data }
    }

    pub fn session_created(session: SessionDescriptor) -> Self {
        Self::SessionCreated {
            session: Box::new(session),
        }
    }

    pub fn session_exited(session_id: SessionId, exit_code: Option<i32>) -> Self {
        Self::SessionExited {
            session_id,
            exit_code,
        }
    }

    pub fn state_changed(
        session_id: SessionId,
        state: DetailedState,
        previous: DetailedState,
    ) -> Self {
        Self::SessionStateChanged {
            session_id,
            state,
            previous,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Payload size for backpressure accounting; only output-class frames
    /// carry meaningful bulk.
    pub fn payload_bytes(&self) -> usize {
        match self {
            Self::Scrollback { data, .. } | Self::Output { data, .. } => data.len(),
            _ => 0,
        }
    }
}
