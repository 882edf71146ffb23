//! tmux multiplexer backend.
//!
//! Agents are hosted in detached tmux sessions named `amux-<id>`, which
//! survive supervisor restarts. Output is teed by `pipe-pane` into a
//! per-session pipe file polled on a fixed cadence; input is staged into a
//! temp file and delivered via `load-buffer`/`paste-buffer` so binary
//! bytes survive untouched. tmux does not push exit notifications, so the
//! supervisor runs a session-list poll (see the supervisor's exit sweep).

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use amux_core::{SessionDescriptor, SessionId};

use crate::config::SENSITIVE_ENV_VARS;

use super::{DriverError, DriverEvent};

/// Prefix for tmux session names owned by this supervisor.
pub const SESSION_PREFIX: &str = "amux-";

/// Pipe-file poll cadence.
pub const PIPE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Session-list exit poll cadence.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Bound on any single tmux subprocess invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Pane lines replayed through the detector on recovery.
pub const RECOVERY_BOOTSTRAP_LINES: u32 = 50;

/// Result of asking the daemon for its session names.
#[derive(Debug)]
pub enum SessionListing {
    /// Names currently hosted by the daemon.
    Names(HashSet<String>),
    /// The daemon is not running at all; every managed session is gone.
    NoServer,
}

/// Checks whether the tmux binary is available.
pub fn is_available() -> bool {
    StdCommand::new("tmux")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// tmux session name for a session id.
pub fn session_name(id: &SessionId) -> String {
    format!("{SESSION_PREFIX}{id}")
}

/// Extracts the session id from a prefixed tmux session name.
pub fn id_from_session_name(name: &str) -> Option<SessionId> {
    name.strip_prefix(SESSION_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(SessionId::new)
}

/// Single-quote shell escaping for one argv element.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Runs one tmux command with a bounded timeout, returning stdout.
async fn tmux(args: &[&str]) -> Result<String, DriverError> {
    let output = tokio::time::timeout(
        COMMAND_TIMEOUT,
        Command::new("tmux").args(args).output(),
    )
    .await
    .map_err(|_| DriverError::Command {
        reason: format!("tmux {} timed out", args.first().unwrap_or(&"")),
    })?
    .map_err(|e| DriverError::Command {
        reason: format!("tmux spawn: {e}"),
    })?;

    if !output.status.success() {
        return Err(DriverError::Command {
            reason: format!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// tmux driver state: the per-user state directory holding pipe files and
/// persisted session metadata.
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    state_dir: PathBuf,
}

impl TmuxBackend {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    fn pipes_dir(&self) -> PathBuf {
        self.state_dir.join("pipes")
    }

    fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn pipe_path(&self, id: &SessionId) -> PathBuf {
        self.pipes_dir().join(format!("{id}.pipe"))
    }

    fn input_path(&self, id: &SessionId) -> PathBuf {
        self.pipes_dir().join(format!("input-{id}.tmp"))
    }

    fn metadata_path(&self, id: &SessionId) -> PathBuf {
        self.sessions_dir().join(format!("{id}.json"))
    }

    /// Creates the state directory tree with owner-only permissions.
    pub fn ensure_dirs(&self) -> Result<(), DriverError> {
        use std::os::unix::fs::DirBuilderExt;
        for dir in [&self.state_dir, &self.pipes_dir(), &self.sessions_dir()] {
            if !dir.exists() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(dir)?;
            }
        }
        Ok(())
    }

    /// Recreates the pipe file empty with owner-only permissions.
    fn recreate_pipe(&self, id: &SessionId) -> Result<PathBuf, DriverError> {
        use std::os::unix::fs::OpenOptionsExt;
        let path = self.pipe_path(id);
        let _ = std::fs::remove_file(&path);
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        Ok(path)
    }

    /// Creates the detached session, attaches the pipe tee, and returns
    /// the pane pid.
    ///
    /// Sensitive variables are genuinely removed from the agent's
    /// environment, not set to empty: the command is wrapped in `env -u`
    /// so the spawned process never sees them, and the session
    /// environment is scrubbed with `set-environment -u` so panes created
    /// later cannot reintroduce them.
    pub async fn create_session(
        &self,
        id: &SessionId,
        command: &str,
        args: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<u32, DriverError> {
        self.ensure_dirs()?;
        let pipe = self.recreate_pipe(id)?;

        let target = session_name(id);
        let cols_s = cols.to_string();
        let rows_s = rows.to_string();
        let cwd_s = cwd.to_string_lossy().into_owned();

        let quoted = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .map(|a| shell_quote(&a))
            .collect::<Vec<_>>()
            .join(" ");
        let unsets = SENSITIVE_ENV_VARS
            .iter()
            .map(|var| format!("-u {var}"))
            .collect::<Vec<_>>()
            .join(" ");
        let shell_command = format!("env {unsets} {quoted}");

        let argv = vec![
            "new-session",
            "-d",
            "-s",
            &target,
            "-x",
            &cols_s,
            "-y",
            &rows_s,
            "-c",
            &cwd_s,
            &shell_command,
        ];

        tmux(&argv).await?;

        for var in SENSITIVE_ENV_VARS {
            if let Err(e) = tmux(&["set-environment", "-t", &target, "-u", var]).await {
                // The variable may simply be absent from the session env.
                debug!(%id, var = %var, error = %e, "set-environment -u failed");
            }
        }

        self.attach_pipe_inner(&target, &pipe).await?;

        self.pane_pid(id)
            .await?
            .ok_or_else(|| DriverError::Command {
                reason: format!("no pane pid for {target}"),
            })
    }

    /// Re-attaches the output tee after recreating the pipe file. Used on
    /// recovery; on failure the pipe is removed and the caller skips the id.
    pub async fn reattach_pipe(&self, id: &SessionId) -> Result<PathBuf, DriverError> {
        self.ensure_dirs()?;
        let pipe = self.recreate_pipe(id)?;
        let target = session_name(id);
        match self.attach_pipe_inner(&target, &pipe).await {
            Ok(()) => Ok(pipe),
            Err(e) => {
                let _ = std::fs::remove_file(&pipe);
                Err(e)
            }
        }
    }

    async fn attach_pipe_inner(
        &self,
        target: &str,
        pipe: &Path,
    ) -> Result<(), DriverError> {
        let tee = format!("cat >> {}", shell_quote(&pipe.to_string_lossy()));
        tmux(&["pipe-pane", "-t", target, "-o", &tee]).await?;
        Ok(())
    }

    /// Pane pid of a session, when the daemon still knows it.
    pub async fn pane_pid(&self, id: &SessionId) -> Result<Option<u32>, DriverError> {
        let target = session_name(id);
        let out = tmux(&["display-message", "-p", "-t", &target, "#{pane_pid}"]).await?;
        Ok(out.trim().parse().ok())
    }

    /// Pane working directory, used when synthesizing recovered descriptors.
    pub async fn pane_cwd(&self, id: &SessionId) -> Option<PathBuf> {
        let target = session_name(id);
        tmux(&["display-message", "-p", "-t", &target, "#{pane_current_path}"])
            .await
            .ok()
            .map(|out| PathBuf::from(out.trim()))
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Last `lines` of visible pane content, for detector bootstrap.
    pub async fn capture_tail(
        &self,
        id: &SessionId,
        lines: u32,
    ) -> Result<String, DriverError> {
        let target = session_name(id);
        let start = format!("-{lines}");
        tmux(&["capture-pane", "-p", "-t", &target, "-S", &start]).await
    }

    /// Binary-safe input delivery: stage into a temp file, load it into a
    /// named buffer, paste the buffer into the session. The temp file is
    /// removed by a guard even when a tmux command fails.
    pub async fn write_input(
        &self,
        id: &SessionId,
        data: &[u8],
    ) -> Result<(), DriverError> {
        use std::os::unix::fs::OpenOptionsExt;

        self.ensure_dirs()?;
        let staging = self.input_path(id);
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&staging)?;
            file.write_all(data)?;
        }
        let _guard = TempFileGuard(staging.clone());

        let buffer = format!("{SESSION_PREFIX}input-{id}");
        let target = session_name(id);
        let staging_s = staging.to_string_lossy().into_owned();

        tmux(&["load-buffer", "-b", &buffer, &staging_s]).await?;
        tmux(&["paste-buffer", "-d", "-b", &buffer, "-t", &target]).await?;
        Ok(())
    }

    /// Issues a resize-window. Failure leaves descriptor dimensions alone.
    pub async fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> bool {
        let target = session_name(id);
        let cols_s = cols.to_string();
        let rows_s = rows.to_string();
        tmux(&["resize-window", "-t", &target, "-x", &cols_s, "-y", &rows_s])
            .await
            .is_ok()
    }

    /// Kills the tmux session. Errors are logged, not propagated: the
    /// session may already be gone.
    pub async fn kill_session(&self, id: &SessionId) {
        let target = session_name(id);
        if let Err(e) = tmux(&["kill-session", "-t", &target]).await {
            debug!(%id, error = %e, "kill-session failed (already gone?)");
        }
    }

    /// Removes the pipe file and persisted metadata for a session.
    pub fn remove_files(&self, id: &SessionId) {
        let _ = std::fs::remove_file(self.pipe_path(id));
        let _ = std::fs::remove_file(self.metadata_path(id));
    }

    /// Removes only the pipe file (exit sweep path; metadata survives
    /// until an explicit kill).
    pub fn remove_pipe(&self, id: &SessionId) {
        let _ = std::fs::remove_file(self.pipe_path(id));
    }

    /// Persists the descriptor JSON, rewritten on every metadata mutation.
    pub fn write_metadata(&self, descriptor: &SessionDescriptor) {
        use std::os::unix::fs::OpenOptionsExt;

        if let Err(e) = self.ensure_dirs() {
            warn!(error = %e, "cannot create state dirs for metadata");
            return;
        }
        let path = self.metadata_path(&descriptor.id);
        let json = match serde_json::to_vec(descriptor) {
            Ok(j) => j,
            Err(e) => {
                warn!(id = %descriptor.id, error = %e, "metadata serialize failed");
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(&json)
            });
        if let Err(e) = result {
            warn!(id = %descriptor.id, error = %e, "metadata write failed");
        }
    }

    /// Loads persisted metadata for a recovered session, if present.
    pub fn load_metadata(&self, id: &SessionId) -> Option<SessionDescriptor> {
        let raw = std::fs::read(self.metadata_path(id)).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(desc) => Some(desc),
            Err(e) => {
                warn!(%id, error = %e, "discarding unreadable session metadata");
                None
            }
        }
    }

    /// Session ids with our prefix currently hosted by the daemon.
    pub async fn discover_sessions(&self) -> Vec<SessionId> {
        match list_session_names().await {
            Ok(SessionListing::Names(names)) => names
                .iter()
                .filter_map(|n| id_from_session_name(n))
                .collect(),
            Ok(SessionListing::NoServer) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "session discovery failed");
                Vec::new()
            }
        }
    }
}

/// Removes the staged input file when dropped, even on command failure.
struct TempFileGuard(PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Queries the daemon for its current session names, distinguishing a
/// stopped daemon from transient failures.
pub async fn list_session_names() -> Result<SessionListing, DriverError> {
    let output = tokio::time::timeout(
        COMMAND_TIMEOUT,
        Command::new("tmux")
            .args(["list-sessions", "-F", "#{session_name}"])
            .output(),
    )
    .await
    .map_err(|_| DriverError::Command {
        reason: "tmux list-sessions timed out".to_string(),
    })?
    .map_err(|e| DriverError::Command {
        reason: format!("tmux spawn: {e}"),
    })?;

    if output.status.success() {
        let names = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        return Ok(SessionListing::Names(names));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("no server running") || stderr.contains("No such file") {
        return Ok(SessionListing::NoServer);
    }

    Err(DriverError::Command {
        reason: format!("tmux list-sessions failed: {}", stderr.trim()),
    })
}

/// Spawns the pipe poller for one session: every 50 ms, read any bytes
/// past the cursor and push them as output events. A missing pipe file
/// means the session is gone and the poll drops out silently.
pub fn spawn_pipe_poller(
    session_id: SessionId,
    pipe_path: PathBuf,
    tx: mpsc::Sender<DriverEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut cursor: u64 = 0;
        let mut tick = interval(PIPE_POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            let len = match tokio::fs::metadata(&pipe_path).await {
                Ok(meta) => meta.len(),
                Err(_) => {
                    debug!(%session_id, "pipe file gone, stopping poll");
                    return;
                }
            };

            if len <= cursor {
                continue;
            }

            match read_delta(&pipe_path, cursor).await {
                Ok(bytes) if !bytes.is_empty() => {
                    cursor += bytes.len() as u64;
                    let event = DriverEvent::Output {
                        session_id: session_id.clone(),
                        bytes,
                    };
                    if tx.send(event).await.is_err() {
                        return; // supervisor gone
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // Transient read hiccup; the next tick retries.
                    debug!(%session_id, error = %e, "pipe read failed");
                }
            }
        }
    })
}

async fn read_delta(path: &Path, cursor: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(cursor)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}
