//! Streaming fan-out bridge.
//!
//! The bridge multiplexes supervisor events to many concurrent WebSocket
//! clients. Output events coalesce into per-session buffers flushed by a
//! single 16 ms timer; lifecycle and state events pass through
//! immediately. Each client holds a bounded drop-oldest queue for
//! output-class frames and an unbounded channel for state frames.
//!
//! Subscribe ordering is load-bearing and enforced by handling the
//! subscribe inside this actor's serialized loop: resize first, then one
//! scrollback snapshot, then live output.

mod queue;
pub mod ws;

pub use queue::{FrameQueue, MAX_CLIENT_QUEUE_BYTES};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use amux_core::SessionId;
use amux_protocol::DaemonFrame;

use crate::supervisor::{SessionEvent, SupervisorHandle};

/// Ceiling on concurrently connected clients.
pub const MAX_CLIENTS: usize = 50;

/// Close code sent when the client ceiling is reached.
pub const CLOSE_AT_CAPACITY: u16 = 1013;

/// Output coalescing window.
const COALESCE_INTERVAL: Duration = Duration::from_millis(16);

/// One connected client as the bridge actor sees it.
struct ClientConn {
    subscriptions: HashSet<SessionId>,
    /// Bounded, drop-oldest: output and scrollback frames.
    output_queue: Arc<FrameQueue>,
    /// Unbounded: session lifecycle and state frames, never dropped.
    state_tx: mpsc::UnboundedSender<DaemonFrame>,
}

/// Messages from client connection tasks to the bridge actor.
enum BridgeMsg {
    Register {
        client_id: u64,
        output_queue: Arc<FrameQueue>,
        state_tx: mpsc::UnboundedSender<DaemonFrame>,
        respond_to: oneshot::Sender<bool>,
    },
    Deregister {
        client_id: u64,
    },
    Subscribe {
        client_id: u64,
        session_id: SessionId,
        cols: Option<f64>,
        rows: Option<f64>,
    },
    Unsubscribe {
        client_id: u64,
        session_id: SessionId,
    },
    /// Graceful shutdown: flush buffers, drop every client connection,
    /// and stop the actor.
    Shutdown,
}

/// Cheap-to-clone handle for client connection tasks.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<BridgeMsg>,
    /// Cancelled when the bridge closes; connection tasks watch this to
    /// end their sockets (their own frame senders keep the per-client
    /// channels open, so channel closure alone cannot signal them).
    closed: CancellationToken,
}

impl BridgeHandle {
    /// Registers a client; `false` means the ceiling was reached and the
    /// connection must be refused.
    pub async fn register(
        &self,
        client_id: u64,
        output_queue: Arc<FrameQueue>,
        state_tx: mpsc::UnboundedSender<DaemonFrame>,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(BridgeMsg::Register {
                client_id,
                output_queue,
                state_tx,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn deregister(&self, client_id: u64) {
        let _ = self.tx.send(BridgeMsg::Deregister { client_id }).await;
    }

    pub async fn subscribe(
        &self,
        client_id: u64,
        session_id: SessionId,
        cols: Option<f64>,
        rows: Option<f64>,
    ) {
        let _ = self
            .tx
            .send(BridgeMsg::Subscribe {
                client_id,
                session_id,
                cols,
                rows,
            })
            .await;
    }

    pub async fn unsubscribe(&self, client_id: u64, session_id: SessionId) {
        let _ = self
            .tx
            .send(BridgeMsg::Unsubscribe {
                client_id,
                session_id,
            })
            .await;
    }

    /// Closes the bridge: pending output is flushed, every client is
    /// dropped and signalled to close its socket, and the actor stops.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(BridgeMsg::Shutdown).await;
        self.closed.cancelled().await;
    }

    /// Token cancelled when the bridge closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Spawns the bridge actor and returns its handle.
pub fn spawn_bridge(supervisor: SupervisorHandle) -> BridgeHandle {
    let (tx, rx) = mpsc::channel(256);
    let closed = CancellationToken::new();
    let events = supervisor.subscribe();
    let actor = BridgeActor {
        rx,
        events,
        supervisor,
        clients: HashMap::new(),
        buffers: HashMap::new(),
        flush_deadline: None,
        closed: closed.clone(),
    };
    tokio::spawn(actor.run());
    BridgeHandle { tx, closed }
}

/// The bridge actor: owns the subscriber registry and coalesce buffers.
struct BridgeActor {
    rx: mpsc::Receiver<BridgeMsg>,
    events: broadcast::Receiver<SessionEvent>,
    supervisor: SupervisorHandle,
    clients: HashMap<u64, ClientConn>,
    /// Per-session coalesce buffer, flushed together by one timer.
    buffers: HashMap<SessionId, Vec<u8>>,
    flush_deadline: Option<tokio::time::Instant>,
    /// Cancelled when this actor stops, releasing connection tasks.
    closed: CancellationToken,
}

/// Next unit of work for the bridge loop.
enum Tick {
    Msg(BridgeMsg),
    Event(SessionEvent),
    Lagged(u64),
    Flush,
    Stop,
}

impl BridgeActor {
    async fn run(mut self) {
        loop {
            // Resolve the next unit of work first so the channel borrows end
            // before any state mutation.
            let deadline = self.flush_deadline;
            let tick = tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => Tick::Msg(msg),
                    None => Tick::Stop,
                },
                event = self.events.recv() => match event {
                    Ok(event) => Tick::Event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => Tick::Lagged(n),
                    Err(broadcast::error::RecvError::Closed) => Tick::Stop,
                },
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(tokio::time::Instant::now)
                ), if deadline.is_some() => Tick::Flush,
            };

            match tick {
                Tick::Msg(BridgeMsg::Shutdown) => {
                    self.flush_all();
                    self.clients.clear();
                    break;
                }
                Tick::Msg(msg) => self.handle_msg(msg).await,
                Tick::Event(event) => self.handle_event(event),
                Tick::Lagged(n) => {
                    warn!(skipped = n, "bridge lagged behind supervisor events");
                }
                Tick::Flush => self.flush_all(),
                Tick::Stop => break,
            }
        }

        // Release every connection task so the sockets actually close.
        self.closed.cancel();
        debug!("bridge actor stopped");
    }

    async fn handle_msg(&mut self, msg: BridgeMsg) {
        match msg {
            BridgeMsg::Register {
                client_id,
                output_queue,
                state_tx,
                respond_to,
            } => {
                if self.clients.len() >= MAX_CLIENTS {
                    let _ = respond_to.send(false);
                    return;
                }
                self.clients.insert(
                    client_id,
                    ClientConn {
                        subscriptions: HashSet::new(),
                        output_queue,
                        state_tx,
                    },
                );
                debug!(client_id, total = self.clients.len(), "client registered");
                let _ = respond_to.send(true);
            }
            BridgeMsg::Deregister { client_id } => {
                if self.clients.remove(&client_id).is_some() {
                    debug!(client_id, total = self.clients.len(), "client deregistered");
                }
            }
            BridgeMsg::Subscribe {
                client_id,
                session_id,
                cols,
                rows,
            } => {
                self.handle_subscribe(client_id, session_id, cols, rows).await;
            }
            BridgeMsg::Unsubscribe {
                client_id,
                session_id,
            } => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.subscriptions.remove(&session_id);
                }
            }
            // Intercepted by the run loop before dispatch.
            BridgeMsg::Shutdown => {}
        }
    }

    /// Subscribe ordering: flush any buffered output to existing
    /// subscribers, resize the PTY, deliver the scrollback snapshot, then
    /// register the subscription so live output flows. The resize-first
    /// rule makes the agent's SIGWINCH redraw overwrite garbled history.
    async fn handle_subscribe(
        &mut self,
        client_id: u64,
        session_id: SessionId,
        cols: Option<f64>,
        rows: Option<f64>,
    ) {
        self.flush_session(&session_id);

        if cols.is_some() || rows.is_some() {
            if let Err(e) = self
                .supervisor
                .resize(session_id.clone(), cols, rows)
                .await
            {
                debug!(%session_id, error = %e, "subscribe resize rejected");
            }
        }

        let snapshot = self.supervisor.get_scrollback(session_id.clone()).await;

        let Some(client) = self.clients.get_mut(&client_id) else {
            return; // disconnected while we were fetching
        };

        match snapshot {
            Some(bytes) => {
                let data = String::from_utf8_lossy(&bytes).into_owned();
                client
                    .output_queue
                    .push(DaemonFrame::scrollback(session_id.clone(), data));
                client.subscriptions.insert(session_id);
            }
            None => {
                let _ = client.state_tx.send(DaemonFrame::error(format!(
                    "unknown session: {session_id}"
                )));
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Output { session_id, bytes } => {
                self.buffers.entry(session_id).or_default().extend(bytes);
                // Single global timer, armed on the first buffered byte.
                if self.flush_deadline.is_none() {
                    self.flush_deadline =
                        Some(tokio::time::Instant::now() + COALESCE_INTERVAL);
                }
            }
            SessionEvent::Created { descriptor } => {
                self.broadcast_state(DaemonFrame::session_created(*descriptor));
            }
            SessionEvent::StateChanged {
                session_id,
                state,
                previous,
            } => {
                self.broadcast_state(DaemonFrame::state_changed(
                    session_id, state, previous,
                ));
            }
            SessionEvent::Exited {
                session_id,
                exit_code,
            } => {
                // Pending output must precede the terminal frame; nothing
                // for this session is delivered after it.
                self.flush_session(&session_id);
                self.buffers.remove(&session_id);
                for client in self.clients.values_mut() {
                    client.subscriptions.remove(&session_id);
                }
                self.broadcast_state(DaemonFrame::session_exited(
                    session_id, exit_code,
                ));
            }
        }
    }

    /// Flushes every buffered session and disarms the timer.
    fn flush_all(&mut self) {
        let buffers = std::mem::take(&mut self.buffers);
        for (session_id, buf) in buffers {
            Self::fan_out(&mut self.clients, &session_id, buf);
        }
        self.flush_deadline = None;
    }

    /// Flushes one session's buffer without touching the others.
    fn flush_session(&mut self, session_id: &SessionId) {
        if let Some(buf) = self.buffers.remove(session_id) {
            Self::fan_out(&mut self.clients, session_id, buf);
        }
    }

    fn fan_out(
        clients: &mut HashMap<u64, ClientConn>,
        session_id: &SessionId,
        buf: Vec<u8>,
    ) {
        if buf.is_empty() {
            return;
        }
        let data = String::from_utf8_lossy(&buf).into_owned();
        for client in clients.values() {
            if client.subscriptions.contains(session_id) {
                client
                    .output_queue
                    .push(DaemonFrame::output(session_id.clone(), data.clone()));
            }
        }
    }

    fn broadcast_state(&mut self, frame: DaemonFrame) {
        let mut dead = Vec::new();
        for (client_id, client) in &self.clients {
            if client.state_tx.send(frame.clone()).is_err() {
                dead.push(*client_id);
            }
        }
        for client_id in dead {
            self.clients.remove(&client_id);
            debug!(client_id, "removed dead client");
        }
    }
}
