//! Session domain entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a supervised agent session.
///
/// Eight lowercase hex characters, minted by the supervisor at spawn time.
/// Unique among live sessions; regenerated on collision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Number of hex characters in a session id.
    pub const LEN: usize = 8;

    /// Creates a SessionId from an existing string.
    ///
    /// Used when parsing ids off the wire or out of persisted metadata;
    /// format is not re-validated.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh random id (8 lowercase hex characters).
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple.chars().take(Self::LEN).collect())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Session Status
// ============================================================================

/// Coarse lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The agent process is (believed) alive.
    #[default]
    Running,

    /// The agent process has exited; the descriptor remains in the store
    /// until an explicit kill removes it.
    Exited,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

// ============================================================================
// Detailed State
// ============================================================================

/// Fine-grained session state derived from terminal output by the
/// state detector. Transitions happen only through the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailedState {
    /// Freshly spawned; no recognizable output yet.
    #[default]
    Starting,

    /// Prompt visible; the agent is waiting for input.
    Idle,

    /// The agent is producing output or running a tool.
    Working,

    /// The agent is blocked on a permission prompt.
    PermissionNeeded,

    /// The agent is compacting its conversation.
    Compacting,

    /// The output window ends in an error report.
    Error,
}

impl fmt::Display for DetailedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Working => "working",
            Self::PermissionNeeded => "permission_needed",
            Self::Compacting => "compacting",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Session Descriptor
// ============================================================================

/// Default group label for sessions spawned without one.
pub const DEFAULT_GROUP: &str = "default";

/// The durable, observable record for one supervised session.
///
/// Serialized camelCase: this exact shape is written to the per-session
/// metadata file (tmux backend) and carried in wire frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: SessionId,
    pub name: String,
    pub group: String,
    pub cwd: PathBuf,
    pub status: SessionStatus,
    pub detailed_state: DetailedState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub task_started_at: DateTime<Utc>,
    pub cols: u16,
    pub rows: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub compaction_count: u64,
    pub total_working_ms: u64,
    pub total_idle_ms: u64,
    pub total_permission_wait_ms: u64,
}

impl SessionDescriptor {
    /// Creates a descriptor for a freshly spawned session.
    pub fn new(
        id: SessionId,
        name: impl Into<String>,
        group: impl Into<String>,
        cwd: PathBuf,
        cols: u16,
        rows: u16,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            group: group.into(),
            cwd,
            status: SessionStatus::Running,
            detailed_state: DetailedState::Starting,
            exit_code: None,
            pid: None,
            created_at: now,
            last_activity_at: now,
            task_started_at: now,
            cols,
            rows,
            task: None,
            compaction_count: 0,
            total_working_ms: 0,
            total_idle_ms: 0,
            total_permission_wait_ms: 0,
        }
    }

    /// Whether the session still accepts writes and resizes.
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    /// Marks the session exited: pid cleared, exit code recorded.
    pub fn mark_exited(&mut self, exit_code: Option<i32>) {
        self.status = SessionStatus::Exited;
        self.exit_code = exit_code;
        self.pid = None;
    }

    /// Refreshes the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_8_lowercase_hex() {
        for _ in 0..64 {
            let id = SessionId::generate();
            assert_eq!(id.as_str().len(), 8);
            assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()
                && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn descriptor_serializes_camel_case() {
        let desc = SessionDescriptor::new(
            SessionId::new("ab12cd34"),
            "test",
            DEFAULT_GROUP,
            PathBuf::from("/tmp"),
            80,
            24,
        );
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["detailedState"], "starting");
        assert_eq!(json["status"], "running");
        assert_eq!(json["compactionCount"], 0);
        // absent fields stay absent
        assert!(json.get("exitCode").is_none());
        assert!(json.get("pid").is_none());
        assert!(json.get("task").is_none());
    }

    #[test]
    fn descriptor_roundtrips() {
        let mut desc = SessionDescriptor::new(
            SessionId::new("deadbeef"),
            "roundtrip",
            "g1",
            PathBuf::from("/tmp"),
            120,
            40,
        );
        desc.mark_exited(Some(0));

        let json = serde_json::to_string(&desc).unwrap();
        let back: SessionDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, desc.id);
        assert_eq!(back.status, SessionStatus::Exited);
        assert_eq!(back.exit_code, Some(0));
        assert!(back.pid.is_none());
    }

    #[test]
    fn mark_exited_clears_pid() {
        let mut desc = SessionDescriptor::new(
            SessionId::generate(),
            "x",
            DEFAULT_GROUP,
            PathBuf::from("/"),
            80,
            24,
        );
        desc.pid = Some(4242);
        desc.mark_exited(None);
        assert_eq!(desc.status, SessionStatus::Exited);
        assert!(desc.pid.is_none());
        assert!(desc.exit_code.is_none());
    }
}
