//! Client interface for interacting with the SupervisorActor.
//!
//! `SupervisorHandle` is a cheap-to-clone handle for sending commands to
//! the supervisor actor and subscribing to session events. Channel errors
//! map to `SupervisorError::ChannelClosed`.

use tokio::sync::{broadcast, mpsc, oneshot};

use amux_core::{SessionDescriptor, SessionId, TranscriptEntry};

use crate::driver::DriverEvent;

use super::commands::{
    SessionEvent, SessionMetrics, SpawnOptions, SupervisorCommand, SupervisorError,
};

/// Handle for interacting with the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorCommand>,
    event_sender: broadcast::Sender<SessionEvent>,
    driver_sender: mpsc::Sender<DriverEvent>,
}

impl SupervisorHandle {
    pub(super) fn new(
        sender: mpsc::Sender<SupervisorCommand>,
        event_sender: broadcast::Sender<SessionEvent>,
        driver_sender: mpsc::Sender<DriverEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
            driver_sender,
        }
    }

    /// Spawns a new agent session and returns its descriptor.
    ///
    /// # Errors
    /// - `InvalidCwd` / `DisallowedArg` for bad options
    /// - `AtCapacity` when the session ceiling is reached
    /// - `Driver` when the backend fails to host the session
    pub async fn spawn(
        &self,
        opts: SpawnOptions,
    ) -> Result<SessionDescriptor, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::Spawn {
                opts: Box::new(opts),
                respond_to: tx,
            })
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)?
    }

    /// Injects input bytes into a running session.
    pub async fn write(
        &self,
        session_id: SessionId,
        data: Vec<u8>,
    ) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::Write {
                session_id,
                data,
                respond_to: tx,
            })
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)?
    }

    /// Resizes a running session's terminal, returning the clamped
    /// dimensions actually applied.
    pub async fn resize(
        &self,
        session_id: SessionId,
        cols: Option<f64>,
        rows: Option<f64>,
    ) -> Result<(u16, u16), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::Resize {
                session_id,
                cols,
                rows,
                respond_to: tx,
            })
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)?
    }

    /// Kills a session. Returns `false` only when the id is unknown.
    pub async fn kill(&self, session_id: SessionId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SupervisorCommand::Kill {
                session_id,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stops the exit poller, then kills every session.
    pub async fn kill_all(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SupervisorCommand::KillAll { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Gets a single session descriptor.
    pub async fn get_session(&self, session_id: SessionId) -> Option<SessionDescriptor> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::GetSession {
                session_id,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?.map(|boxed| *boxed)
    }

    /// Lists all session descriptors, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionDescriptor> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SupervisorCommand::ListSessions { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Distinct group labels.
    pub async fn groups(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SupervisorCommand::Groups { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Defensive copy of a session's scrollback bytes.
    pub async fn get_scrollback(&self, session_id: SessionId) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::GetScrollback {
                session_id,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Defensive copy of a session's transcript.
    pub async fn get_transcript(
        &self,
        session_id: SessionId,
    ) -> Option<Vec<TranscriptEntry>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::GetTranscript {
                session_id,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Per-state time accounting for one session.
    pub async fn get_metrics(&self, session_id: SessionId) -> Option<SessionMetrics> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::GetMetrics {
                session_id,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Number of sessions in the store.
    pub async fn count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SupervisorCommand::Count { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Updates a session's task and refreshes its start timestamp.
    pub async fn set_task(
        &self,
        session_id: SessionId,
        task: String,
    ) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::SetTask {
                session_id,
                task,
                respond_to: tx,
            })
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)?
    }

    /// Subscribes to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Channel used by driver readers and pollers to push output and exit
    /// events into the serialized core.
    pub fn driver_sender(&self) -> mpsc::Sender<DriverEvent> {
        self.driver_sender.clone()
    }

    /// Whether the actor is still running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
