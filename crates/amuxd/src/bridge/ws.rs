//! WebSocket streaming surface.
//!
//! Upgrade path `/ws` with the auth token in a query parameter (or bearer
//! header), validated with a constant-time comparison BEFORE the upgrade
//! completes; failure answers with a plain HTTP 401. Nothing later in the
//! connection lifecycle can re-authenticate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use amux_protocol::{ClientFrame, DaemonFrame, MAX_INPUT_BYTES};

use crate::control::constant_time_eq;
use crate::supervisor::SupervisorHandle;

use super::{BridgeHandle, FrameQueue, CLOSE_AT_CAPACITY, MAX_CLIENT_QUEUE_BYTES};

/// Shared state for the streaming surface.
pub struct WsState {
    pub bridge: BridgeHandle,
    pub supervisor: SupervisorHandle,
    pub auth_token: String,
    next_client_id: AtomicU64,
}

impl WsState {
    pub fn new(
        bridge: BridgeHandle,
        supervisor: SupervisorHandle,
        auth_token: String,
    ) -> Self {
        Self {
            bridge,
            supervisor,
            auth_token,
            next_client_id: AtomicU64::new(1),
        }
    }
}

#[derive(Deserialize)]
struct WsAuthParams {
    token: Option<String>,
}

/// Builds the `/ws` route.
pub fn routes(state: Arc<WsState>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

/// `GET /ws` - authenticate, then upgrade.
async fn ws_upgrade(
    State(state): State<Arc<WsState>>,
    headers: HeaderMap,
    Query(params): Query<WsAuthParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = bearer_token(&headers).or(params.token);
    let authorized = token
        .map(|t| constant_time_eq(t.as_bytes(), state.auth_token.as_bytes()))
        .unwrap_or(false);

    if !authorized {
        warn!("ws upgrade rejected: bad or missing token");
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// One authenticated client connection.
async fn handle_socket(socket: WebSocket, state: Arc<WsState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    let output_queue = Arc::new(FrameQueue::new(MAX_CLIENT_QUEUE_BYTES));
    let (state_tx, mut state_rx) = mpsc::unbounded_channel::<DaemonFrame>();

    let (mut sender, mut receiver) = socket.split();

    if !state
        .bridge
        .register(client_id, Arc::clone(&output_queue), state_tx.clone())
        .await
    {
        info!(client_id, "refusing client: bridge at capacity");
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_AT_CAPACITY,
                reason: "too many clients".into(),
            })))
            .await;
        return;
    }

    info!(client_id, "ws client connected");

    // Full session list on connect.
    let sessions = state.supervisor.list_sessions().await;
    let _ = state_tx.send(DaemonFrame::sessions(sessions));

    let bridge_closed = state.bridge.closed_token();
    let mut server_closing = false;
    loop {
        tokio::select! {
            // State frames first: they are never dropped and never starved.
            biased;

            frame = state_rx.recv() => {
                let Some(frame) = frame else { break };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            _ = bridge_closed.cancelled() => {
                server_closing = true;
                break;
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state, client_id, &state_tx, text.as_str())
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary ignored
                    Some(Err(e)) => {
                        debug!(client_id, error = %e, "ws receive error");
                        break;
                    }
                }
            }

            frame = output_queue.pop() => {
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    if server_closing {
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: 1001,
                reason: "server shutting down".into(),
            })))
            .await;
    }

    state.bridge.deregister(client_id).await;
    info!(
        client_id,
        dropped_frames = output_queue.dropped(),
        "ws client disconnected"
    );
}

async fn send_frame<S>(sender: &mut S, frame: &DaemonFrame) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Dispatches one parsed client frame. Malformed messages are answered
/// with an error frame and never terminate the connection.
async fn handle_client_frame(
    state: &Arc<WsState>,
    client_id: u64,
    state_tx: &mpsc::UnboundedSender<DaemonFrame>,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = state_tx.send(DaemonFrame::error(format!("malformed message: {e}")));
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe {
            session_id,
            cols,
            rows,
        } => {
            state
                .bridge
                .subscribe(client_id, session_id, cols, rows)
                .await;
        }
        ClientFrame::Unsubscribe { session_id } => {
            state.bridge.unsubscribe(client_id, session_id).await;
        }
        ClientFrame::Input { session_id, data } => {
            if data.len() > MAX_INPUT_BYTES {
                debug!(client_id, size = data.len(), "dropping oversized input");
                return; // rejected silently
            }
            if let Err(e) = state
                .supervisor
                .write(session_id, data.into_bytes())
                .await
            {
                let _ = state_tx.send(DaemonFrame::error(e.to_string()));
            }
        }
        ClientFrame::Resize {
            session_id,
            cols,
            rows,
        } => {
            if let Err(e) = state
                .supervisor
                .resize(session_id, Some(cols), Some(rows))
                .await
            {
                let _ = state_tx.send(DaemonFrame::error(e.to_string()));
            }
        }
    }
}
