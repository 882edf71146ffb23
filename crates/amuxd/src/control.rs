//! HTTP control surface.
//!
//! A thin collaborator translating REST requests into supervisor
//! operations. Every request carries the auth token (bearer header or
//! `?token=` query) compared in constant time; bodied requests must
//! declare a JSON content type and stay under the body cap; spawns are
//! rate-limited per source address; browser origins are only accepted
//! from localhost.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use amux_core::SessionId;

use crate::supervisor::{SpawnOptions, SupervisorError, SupervisorHandle};

/// Request body cap (bytes).
pub const MAX_BODY_BYTES: usize = 65_536;

/// Spawn rate limit: requests per window per source address.
const SPAWN_RATE_LIMIT: usize = 10;
const SPAWN_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Sweep cadence for pruning emptied rate-limit windows.
const RATE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Auth and origin gating
// ============================================================================

/// Constant-time byte comparison for token checks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// `Origin` is allowed only for localhost on any port.
pub(crate) fn origin_allowed(origin: &str) -> bool {
    let rest = origin
        .strip_prefix("http://localhost")
        .or_else(|| origin.strip_prefix("http://127.0.0.1"));
    match rest {
        Some("") => true,
        Some(port) => port.starts_with(':') && port[1..].chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

// ============================================================================
// Per-address spawn rate limiter
// ============================================================================

/// Sliding-window limiter keyed by source address.
pub struct IpRateLimiter {
    windows: Mutex<HashMap<IpAddr, Vec<Instant>>>,
    limit: usize,
    window: Duration,
}

impl IpRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    /// Records one hit; `false` means over the limit.
    pub fn check(&self, addr: IpAddr) -> bool {
        let now = Instant::now();
        let Ok(mut windows) = self.windows.lock() else {
            return true;
        };
        let hits = windows.entry(addr).or_default();
        hits.retain(|t| now.duration_since(*t) < self.window);
        if hits.len() >= self.limit {
            return false;
        }
        hits.push(now);
        true
    }

    /// Prunes address entries whose windows have emptied.
    pub fn sweep(&self) {
        let now = Instant::now();
        if let Ok(mut windows) = self.windows.lock() {
            windows.retain(|_, hits| {
                hits.retain(|t| now.duration_since(*t) < self.window);
                !hits.is_empty()
            });
        }
    }

    #[cfg(test)]
    fn tracked_addresses(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }
}

impl Default for IpRateLimiter {
    /// Spawn limiter: 10 requests per 60 s per source address.
    fn default() -> Self {
        Self::new(SPAWN_RATE_LIMIT, SPAWN_RATE_WINDOW)
    }
}

// ============================================================================
// Router
// ============================================================================

/// Shared state for control handlers.
pub struct ControlState {
    pub supervisor: SupervisorHandle,
    pub auth_token: String,
    pub browse_enabled: bool,
    pub rate_limiter: IpRateLimiter,
}

/// Builds the `/api` router and starts the rate-limit sweeper.
pub fn routes(state: Arc<ControlState>) -> Router {
    spawn_rate_sweeper(Arc::clone(&state));

    Router::new()
        .route("/api/sessions", get(list_sessions).post(spawn_session))
        .route("/api/sessions/{id}", get(get_session).delete(kill_session))
        .route("/api/sessions/{id}/input", post(write_input))
        .route("/api/sessions/{id}/resize", post(resize_session))
        .route("/api/sessions/{id}/task", post(set_task))
        .route("/api/sessions/{id}/scrollback", get(get_scrollback))
        .route("/api/sessions/{id}/transcript", get(get_transcript))
        .route("/api/sessions/{id}/metrics", get(get_metrics))
        .route("/api/groups", get(list_groups))
        .route("/api/browse", get(browse))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

fn spawn_rate_sweeper(state: Arc<ControlState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(RATE_SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            state.rate_limiter.sweep();
        }
    });
}

#[derive(Deserialize)]
struct AuthParams {
    token: Option<String>,
}

/// Auth + origin gate shared by every handler.
fn gate(
    state: &ControlState,
    headers: &HeaderMap,
    params: &AuthParams,
) -> Result<(), Response> {
    if let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) {
        if !origin_allowed(origin) {
            return Err((
                StatusCode::FORBIDDEN,
                Json(json!({"error": "origin not allowed"})),
            )
                .into_response());
        }
    }

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| params.token.clone());

    let ok = token
        .map(|t| constant_time_eq(t.as_bytes(), state.auth_token.as_bytes()))
        .unwrap_or(false);

    if !ok {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid or missing token"})),
        )
            .into_response());
    }
    Ok(())
}

/// Maps supervisor failures onto status codes.
fn error_response(err: SupervisorError) -> Response {
    let status = match &err {
        SupervisorError::InvalidCwd { .. } | SupervisorError::DisallowedArg { .. } => {
            StatusCode::BAD_REQUEST
        }
        SupervisorError::SessionNotFound(_) | SupervisorError::NotRunning(_) => {
            StatusCode::NOT_FOUND
        }
        SupervisorError::AtCapacity { .. } => StatusCode::TOO_MANY_REQUESTS,
        SupervisorError::Driver(_) | SupervisorError::ChannelClosed => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnRequest {
    name: Option<String>,
    group: Option<String>,
    cwd: PathBuf,
    #[serde(default)]
    args: Vec<String>,
    cols: Option<f64>,
    rows: Option<f64>,
    task: Option<String>,
    skip_permissions: Option<bool>,
}

async fn spawn_session(
    State(state): State<Arc<ControlState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
    Json(req): Json<SpawnRequest>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }

    if !state.rate_limiter.check(addr.ip()) {
        debug!(ip = %addr.ip(), "spawn rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "spawn rate limit exceeded"})),
        )
            .into_response();
    }

    let opts = SpawnOptions {
        name: req.name,
        group: req.group,
        cwd: req.cwd,
        args: req.args,
        cols: req.cols,
        rows: req.rows,
        task: req.task,
        skip_permissions: req.skip_permissions,
    };

    match state.supervisor.spawn(opts).await {
        Ok(descriptor) => {
            info!(id = %descriptor.id, name = %descriptor.name, "session spawned via http");
            (StatusCode::CREATED, Json(descriptor)).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn list_sessions(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }
    Json(state.supervisor.list_sessions().await).into_response()
}

async fn get_session(
    State(state): State<Arc<ControlState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }
    match state.supervisor.get_session(SessionId::new(id)).await {
        Some(descriptor) => Json(descriptor).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response(),
    }
}

async fn kill_session(
    State(state): State<Arc<ControlState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }
    if state.supervisor.kill(SessionId::new(id)).await {
        Json(json!({"removed": true})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct InputRequest {
    data: String,
}

async fn write_input(
    State(state): State<Arc<ControlState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
    Json(req): Json<InputRequest>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }
    match state
        .supervisor
        .write(SessionId::new(id), req.data.into_bytes())
        .await
    {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct ResizeRequest {
    cols: Option<f64>,
    rows: Option<f64>,
}

async fn resize_session(
    State(state): State<Arc<ControlState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
    Json(req): Json<ResizeRequest>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }
    match state
        .supervisor
        .resize(SessionId::new(id), req.cols, req.rows)
        .await
    {
        Ok((cols, rows)) => Json(json!({"cols": cols, "rows": rows})).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct TaskRequest {
    task: String,
}

async fn set_task(
    State(state): State<Arc<ControlState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
    Json(req): Json<TaskRequest>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }
    match state.supervisor.set_task(SessionId::new(id), req.task).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_scrollback(
    State(state): State<Arc<ControlState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }
    match state.supervisor.get_scrollback(SessionId::new(id)).await {
        Some(bytes) => Json(json!({
            "data": String::from_utf8_lossy(&bytes).into_owned(),
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response(),
    }
}

async fn get_transcript(
    State(state): State<Arc<ControlState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }
    match state.supervisor.get_transcript(SessionId::new(id)).await {
        Some(entries) => Json(entries).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response(),
    }
}

async fn get_metrics(
    State(state): State<Arc<ControlState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }
    match state.supervisor.get_metrics(SessionId::new(id)).await {
        Some(metrics) => Json(metrics).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response(),
    }
}

async fn list_groups(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
) -> Response {
    if let Err(resp) = gate(&state, &headers, &params) {
        return resp;
    }
    Json(state.supervisor.groups().await).into_response()
}

// ============================================================================
// Browse endpoint
// ============================================================================

#[derive(Deserialize)]
struct BrowseParams {
    token: Option<String>,
    path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BrowseEntry {
    name: String,
    path: String,
    is_dir: bool,
}

/// Lists a directory. Only realpaths at or beneath the user's home
/// directory are served.
async fn browse(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    Query(params): Query<BrowseParams>,
) -> Response {
    let auth = AuthParams {
        token: params.token.clone(),
    };
    if let Err(resp) = gate(&state, &headers, &auth) {
        return resp;
    }

    if !state.browse_enabled {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "browse endpoint disabled"})),
        )
            .into_response();
    }

    let Some(home) = dirs::home_dir() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "no home directory"})),
        )
            .into_response();
    };

    let requested = params
        .path
        .map(PathBuf::from)
        .unwrap_or_else(|| home.clone());

    let real = match requested.canonicalize() {
        Ok(real) => real,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "path does not exist"})),
            )
                .into_response();
        }
    };

    if !real.starts_with(&home) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "access denied"})),
        )
            .into_response();
    }

    let mut entries = Vec::new();
    match std::fs::read_dir(&real) {
        Ok(dir) => {
            for entry in dir.flatten() {
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                entries.push(BrowseEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: entry.path().to_string_lossy().into_owned(),
                    is_dir,
                });
            }
        }
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("not readable: {e}")})),
            )
                .into_response();
        }
    }
    entries.sort_by(|a, b| (!a.is_dir, &a.name).cmp(&(!b.is_dir, &b.name)));

    Json(json!({
        "path": real.to_string_lossy(),
        "entries": entries,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_behaves() {
        assert!(constant_time_eq(b"secret-token", b"secret-token"));
        assert!(!constant_time_eq(b"secret-token", b"secret-tokeX"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn origin_gate_allows_localhost_any_port() {
        assert!(origin_allowed("http://localhost"));
        assert!(origin_allowed("http://localhost:3000"));
        assert!(origin_allowed("http://127.0.0.1:18900"));
        assert!(!origin_allowed("https://localhost"));
        assert!(!origin_allowed("http://localhost.evil.com"));
        assert!(!origin_allowed("http://192.168.1.4:3000"));
        assert!(!origin_allowed("http://127.0.0.1x"));
    }

    #[test]
    fn rate_limiter_enforces_window() {
        let limiter = IpRateLimiter::new(3, Duration::from_secs(60));
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.check(addr));
        assert!(limiter.check(addr));
        assert!(limiter.check(addr));
        assert!(!limiter.check(addr));

        // A different address has its own window.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(other));
    }

    #[test]
    fn rate_limiter_sweep_prunes_expired() {
        let limiter = IpRateLimiter::new(3, Duration::from_millis(1));
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.check(addr));
        assert_eq!(limiter.tracked_addresses(), 1);

        std::thread::sleep(Duration::from_millis(5));
        limiter.sweep();
        assert_eq!(limiter.tracked_addresses(), 0);
    }
}
