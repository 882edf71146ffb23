//! Supervisor actor - owns all session state and processes commands.
//!
//! The actor is the single owner of the session store: descriptors,
//! scrollback and transcript rings, detector blocks, and driver resources.
//! It receives commands via an mpsc channel, receives driver push events
//! via a second channel, and publishes events via broadcast. All state
//! mutations happen inside this one task; blocking driver I/O runs on
//! helper threads and re-enters through the channels.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use amux_core::{
    clamp_dimension, ArgvPolicy, DetailedState, DetectorBlock, Scrollback,
    SessionDescriptor, SessionId, SessionStatus, Transcript, Transition,
    IDLE_TIMEOUT, MAX_SESSIONS,
};
use amux_core::limits::truncate_label;
use amux_core::session::DEFAULT_GROUP;

use crate::driver::pty::PtySession;
use crate::driver::tmux::{
    self, session_name, spawn_pipe_poller, TmuxBackend, RECOVERY_BOOTSTRAP_LINES,
};
use crate::driver::{build_child_env, BackendKind, DriverEvent};

use super::commands::{
    SessionEvent, SessionMetrics, SpawnOptions, SupervisorCommand, SupervisorError,
};

/// Base name for auto-assigned session names.
const AUTO_NAME_BASE: &str = "agent";

/// Default spawn dimensions when the caller provides none.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Per-session driver resources owned by the actor.
enum SessionRuntime {
    /// Direct child on a supervisor-owned PTY.
    Pty(PtySession),
    /// tmux-hosted; the pipe poller is the only live resource here.
    Tmux { poller: JoinHandle<()> },
}

/// Everything the actor holds for one session.
struct SessionEntry {
    descriptor: SessionDescriptor,
    scrollback: Scrollback,
    transcript: Transcript,
    detector: DetectorBlock,
    runtime: SessionRuntime,
    /// One-shot task injection, armed at spawn and disarmed by the first
    /// idle transition or by exit, whichever comes first.
    pending_task: Option<String>,
    /// Invalidates stale idle timers.
    idle_generation: u64,
    idle_timer: Option<JoinHandle<()>>,
    /// Guards the one-terminal-event-per-session rule.
    exit_emitted: bool,
}

impl SessionEntry {
    fn stop_timers(&mut self) {
        self.idle_generation = self.idle_generation.wrapping_add(1);
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
        if let SessionRuntime::Tmux { poller } = &self.runtime {
            poller.abort();
        }
    }
}

/// Next unit of work for the actor loop.
enum Incoming {
    Command(SupervisorCommand),
    Driver(DriverEvent),
}

/// The supervisor actor.
pub struct SupervisorActor {
    receiver: mpsc::Receiver<SupervisorCommand>,
    driver_rx: mpsc::Receiver<DriverEvent>,
    /// Cloned into idle-timer tasks so they can re-enter the core.
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    /// Cloned into driver readers and pollers.
    driver_tx: mpsc::Sender<DriverEvent>,
    event_tx: broadcast::Sender<SessionEvent>,

    sessions: HashMap<SessionId, SessionEntry>,
    /// Monotonic auto-name counter; never reused for the supervisor's life.
    name_counter: u64,

    backend: BackendKind,
    tmux: TmuxBackend,
    policy: ArgvPolicy,
    agent_command: String,
    skip_permissions_default: bool,
    transcript_max_entries: usize,

    /// Cancelled before sessions are iterated on kill-all, so a poll tick
    /// cannot interleave with shutdown.
    exit_poll_cancel: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
impl SupervisorActor {
    pub(super) fn new(
        receiver: mpsc::Receiver<SupervisorCommand>,
        driver_rx: mpsc::Receiver<DriverEvent>,
        cmd_tx: mpsc::Sender<SupervisorCommand>,
        driver_tx: mpsc::Sender<DriverEvent>,
        event_tx: broadcast::Sender<SessionEvent>,
        backend: BackendKind,
        tmux: TmuxBackend,
        policy: ArgvPolicy,
        agent_command: String,
        skip_permissions_default: bool,
        transcript_max_entries: usize,
        exit_poll_cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            driver_rx,
            cmd_tx,
            driver_tx,
            event_tx,
            sessions: HashMap::new(),
            name_counter: 0,
            backend,
            tmux,
            policy,
            agent_command,
            skip_permissions_default,
            transcript_max_entries,
            exit_poll_cancel,
        }
    }

    /// Runs the actor event loop until both channels close.
    pub async fn run(mut self) {
        info!(backend = ?self.backend, "supervisor actor starting");

        loop {
            // Resolve the next unit of work first so the channel borrows end
            // before any state mutation.
            let incoming = tokio::select! {
                cmd = self.receiver.recv() => cmd.map(Incoming::Command),
                event = self.driver_rx.recv() => event.map(Incoming::Driver),
            };

            match incoming {
                Some(Incoming::Command(cmd)) => self.handle_command(cmd).await,
                Some(Incoming::Driver(event)) => self.handle_driver_event(event).await,
                None => break,
            }
        }

        info!(sessions = self.sessions.len(), "supervisor actor stopped");
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Spawn { opts, respond_to } => {
                let result = self.handle_spawn(*opts).await;
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Write {
                session_id,
                data,
                respond_to,
            } => {
                let result = self.handle_write(&session_id, data).await;
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Resize {
                session_id,
                cols,
                rows,
                respond_to,
            } => {
                let result = self.handle_resize(&session_id, cols, rows).await;
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Kill {
                session_id,
                respond_to,
            } => {
                let result = self.handle_kill(&session_id).await;
                let _ = respond_to.send(result);
            }
            SupervisorCommand::KillAll { respond_to } => {
                self.handle_kill_all().await;
                let _ = respond_to.send(());
            }
            SupervisorCommand::GetSession {
                session_id,
                respond_to,
            } => {
                let result = self
                    .sessions
                    .get(&session_id)
                    .map(|e| Box::new(e.descriptor.clone()));
                let _ = respond_to.send(result);
            }
            SupervisorCommand::ListSessions { respond_to } => {
                let mut sessions: Vec<SessionDescriptor> = self
                    .sessions
                    .values()
                    .map(|e| e.descriptor.clone())
                    .collect();
                sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                let _ = respond_to.send(sessions);
            }
            SupervisorCommand::Groups { respond_to } => {
                let mut groups: Vec<String> = self
                    .sessions
                    .values()
                    .map(|e| e.descriptor.group.clone())
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                groups.sort();
                let _ = respond_to.send(groups);
            }
            SupervisorCommand::GetScrollback {
                session_id,
                respond_to,
            } => {
                let result = self
                    .sessions
                    .get(&session_id)
                    .map(|e| e.scrollback.snapshot());
                let _ = respond_to.send(result);
            }
            SupervisorCommand::GetTranscript {
                session_id,
                respond_to,
            } => {
                let result = self
                    .sessions
                    .get(&session_id)
                    .map(|e| e.transcript.entries());
                let _ = respond_to.send(result);
            }
            SupervisorCommand::GetMetrics {
                session_id,
                respond_to,
            } => {
                let result = self.sessions.get(&session_id).map(|e| {
                    let d = &e.descriptor;
                    SessionMetrics {
                        detailed_state: d.detailed_state,
                        total_working_ms: d.total_working_ms,
                        total_idle_ms: d.total_idle_ms,
                        total_permission_wait_ms: d.total_permission_wait_ms,
                        current_state_ms: e
                            .detector
                            .elapsed_in_state(Instant::now())
                            .as_millis() as u64,
                        compaction_count: d.compaction_count,
                    }
                });
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Count { respond_to } => {
                let _ = respond_to.send(self.sessions.len());
            }
            SupervisorCommand::SetTask {
                session_id,
                task,
                respond_to,
            } => {
                let result = self.handle_set_task(&session_id, task);
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Driver(event) => self.handle_driver_event(event).await,
            SupervisorCommand::IdleTimeout {
                session_id,
                generation,
            } => self.handle_idle_timeout(&session_id, generation).await,
            SupervisorCommand::ExitSweep { live } => self.handle_exit_sweep(live).await,
        }
    }

    // ========================================================================
    // Spawn
    // ========================================================================

    async fn handle_spawn(
        &mut self,
        opts: SpawnOptions,
    ) -> Result<SessionDescriptor, SupervisorError> {
        if !opts.cwd.is_absolute() || !opts.cwd.is_dir() {
            return Err(SupervisorError::InvalidCwd {
                path: opts.cwd.to_string_lossy().into_owned(),
            });
        }

        self.policy.validate(&opts.args)?;

        if self.sessions.len() >= MAX_SESSIONS {
            warn!(
                current = self.sessions.len(),
                max = MAX_SESSIONS,
                "session store full, rejecting spawn"
            );
            return Err(SupervisorError::AtCapacity { max: MAX_SESSIONS });
        }

        // Explicit option overrides the configured default.
        let skip = opts
            .skip_permissions
            .unwrap_or(self.skip_permissions_default);
        let args = ArgvPolicy::apply_skip_permissions(opts.args, skip);

        let id = self.fresh_id();
        let name = match &opts.name {
            Some(name) if !name.is_empty() => truncate_label(name),
            _ => self.next_auto_name(),
        };
        let group = match &opts.group {
            Some(group) if !group.is_empty() => truncate_label(group),
            _ => DEFAULT_GROUP.to_string(),
        };
        let cols = clamp_dimension(opts.cols, DEFAULT_COLS);
        let rows = clamp_dimension(opts.rows, DEFAULT_ROWS);

        let (pid, runtime) = match self.backend {
            BackendKind::Pty => {
                let env = build_child_env();
                let session = PtySession::spawn(
                    &self.agent_command,
                    &args,
                    &opts.cwd,
                    cols,
                    rows,
                    &env,
                )
                .map_err(|e| SupervisorError::Driver(e.to_string()))?;
                session
                    .spawn_reader(id.clone(), self.driver_tx.clone())
                    .map_err(|e| SupervisorError::Driver(e.to_string()))?;
                (session.pid(), SessionRuntime::Pty(session))
            }
            BackendKind::Tmux => {
                let pid = self
                    .tmux
                    .create_session(
                        &id,
                        &self.agent_command,
                        &args,
                        &opts.cwd,
                        cols,
                        rows,
                    )
                    .await
                    .map_err(|e| SupervisorError::Driver(e.to_string()))?;
                let poller = spawn_pipe_poller(
                    id.clone(),
                    self.tmux.pipe_path(&id),
                    self.driver_tx.clone(),
                );
                (pid, SessionRuntime::Tmux { poller })
            }
        };

        let mut descriptor =
            SessionDescriptor::new(id.clone(), name, group, opts.cwd.clone(), cols, rows);
        descriptor.pid = Some(pid);
        descriptor.task = opts.task.clone();

        if self.backend == BackendKind::Tmux {
            self.tmux.write_metadata(&descriptor);
        }

        info!(
            %id,
            name = %descriptor.name,
            pid,
            backend = ?self.backend,
            total = self.sessions.len() + 1,
            "session spawned"
        );

        self.sessions.insert(
            id,
            SessionEntry {
                descriptor: descriptor.clone(),
                scrollback: Scrollback::new(),
                transcript: Transcript::new(self.transcript_max_entries),
                detector: DetectorBlock::new(Instant::now()),
                runtime,
                pending_task: opts.task,
                idle_generation: 0,
                idle_timer: None,
                exit_emitted: false,
            },
        );

        self.publish(SessionEvent::Created {
            descriptor: Box::new(descriptor.clone()),
        });

        Ok(descriptor)
    }

    /// Mints an id unique among live sessions.
    fn fresh_id(&self) -> SessionId {
        loop {
            let id = SessionId::generate();
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// "agent", "agent 2", "agent 3", ... The counter never rewinds, so
    /// names stay unique across kills.
    fn next_auto_name(&mut self) -> String {
        self.name_counter += 1;
        if self.name_counter == 1 {
            AUTO_NAME_BASE.to_string()
        } else {
            format!("{AUTO_NAME_BASE} {}", self.name_counter)
        }
    }

    // ========================================================================
    // Write / resize / task
    // ========================================================================

    async fn handle_write(
        &mut self,
        session_id: &SessionId,
        data: Vec<u8>,
    ) -> Result<(), SupervisorError> {
        let entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SupervisorError::SessionNotFound(session_id.clone()))?;
        if !entry.descriptor.is_running() {
            return Err(SupervisorError::NotRunning(session_id.clone()));
        }

        match &entry.runtime {
            SessionRuntime::Pty(session) => {
                let writer = session
                    .writer()
                    .map_err(|e| SupervisorError::Driver(e.to_string()))?;
                let payload = data.clone();
                tokio::task::spawn_blocking(move || writer.write_all(&payload))
                    .await
                    .map_err(|e| SupervisorError::Driver(e.to_string()))?
                    .map_err(|e| SupervisorError::Driver(e.to_string()))?;
            }
            SessionRuntime::Tmux { .. } => {
                self.tmux
                    .write_input(session_id, &data)
                    .await
                    .map_err(|e| SupervisorError::Driver(e.to_string()))?;
            }
        }

        let entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SupervisorError::SessionNotFound(session_id.clone()))?;
        entry
            .transcript
            .record_user(&String::from_utf8_lossy(&data));
        // A new assistant segment begins after every user input.
        entry.scrollback.mark_assistant_start();

        Ok(())
    }

    async fn handle_resize(
        &mut self,
        session_id: &SessionId,
        cols: Option<f64>,
        rows: Option<f64>,
    ) -> Result<(u16, u16), SupervisorError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SupervisorError::SessionNotFound(session_id.clone()))?;
        if !entry.descriptor.is_running() {
            return Err(SupervisorError::NotRunning(session_id.clone()));
        }

        let cols = clamp_dimension(cols, entry.descriptor.cols);
        let rows = clamp_dimension(rows, entry.descriptor.rows);

        let accepted = match &entry.runtime {
            SessionRuntime::Pty(session) => session.resize(cols, rows),
            SessionRuntime::Tmux { .. } => self.tmux.resize(session_id, cols, rows).await,
        };

        if accepted {
            if let Some(entry) = self.sessions.get_mut(session_id) {
                entry.descriptor.cols = cols;
                entry.descriptor.rows = rows;
                if self.backend == BackendKind::Tmux {
                    self.tmux.write_metadata(&entry.descriptor);
                }
            }
        }

        Ok((cols, rows))
    }

    fn handle_set_task(
        &mut self,
        session_id: &SessionId,
        task: String,
    ) -> Result<(), SupervisorError> {
        let entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SupervisorError::SessionNotFound(session_id.clone()))?;
        entry.descriptor.task = Some(task);
        entry.descriptor.task_started_at = chrono::Utc::now();
        if self.backend == BackendKind::Tmux {
            self.tmux.write_metadata(&entry.descriptor);
        }
        Ok(())
    }

    // ========================================================================
    // Kill
    // ========================================================================

    /// Kill semantics: removing an already-exited descriptor is silent
    /// (its terminal event was already emitted); killing a running session
    /// terminates it and emits exactly one exit event. Returns `false`
    /// only for unknown ids.
    async fn handle_kill(&mut self, session_id: &SessionId) -> bool {
        let Some(mut entry) = self.sessions.remove(session_id) else {
            return false;
        };

        entry.stop_timers();

        if entry.descriptor.status == SessionStatus::Exited {
            if self.backend == BackendKind::Tmux {
                self.tmux.remove_files(session_id);
            }
            debug!(%session_id, "removed exited session");
            return true;
        }

        let exit_code = match &entry.runtime {
            SessionRuntime::Pty(session) => {
                session.terminate();
                Some(-1)
            }
            SessionRuntime::Tmux { .. } => {
                self.tmux.kill_session(session_id).await;
                self.tmux.remove_files(session_id);
                None
            }
        };

        info!(%session_id, remaining = self.sessions.len(), "session killed");

        self.publish(SessionEvent::Exited {
            session_id: session_id.clone(),
            exit_code,
        });

        true
    }

    async fn handle_kill_all(&mut self) {
        // Stop the exit poller before touching sessions so a tick cannot
        // interleave with the kill loop and double-emit exits.
        self.exit_poll_cancel.cancel();

        let ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        info!(count = ids.len(), "killing all sessions");
        for id in ids {
            self.handle_kill(&id).await;
        }
    }

    // ========================================================================
    // Driver events
    // ========================================================================

    async fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Output { session_id, bytes } => {
                self.handle_output(&session_id, bytes).await;
            }
            DriverEvent::Exited {
                session_id,
                exit_code,
            } => {
                self.handle_driver_exit(&session_id, exit_code);
            }
        }
    }

    async fn handle_output(&mut self, session_id: &SessionId, bytes: Vec<u8>) {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            // Late output from a killed session's reader; drop it.
            return;
        };
        if !entry.descriptor.is_running() {
            return;
        }

        entry.scrollback.push(bytes.clone());
        entry.descriptor.touch();

        let transition = entry.detector.ingest(&bytes, Instant::now());

        self.publish(SessionEvent::Output {
            session_id: session_id.clone(),
            bytes,
        });

        if let Some(transition) = transition {
            self.apply_transition(session_id, transition).await;
        }

        // Every chunk while in `working` re-arms the single-shot idle timer.
        let working = self
            .sessions
            .get(session_id)
            .map(|e| e.detector.state() == DetailedState::Working)
            .unwrap_or(false);
        if working {
            self.arm_idle_timer(session_id);
        }
    }

    fn arm_idle_timer(&mut self, session_id: &SessionId) {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return;
        };
        entry.idle_generation = entry.idle_generation.wrapping_add(1);
        if let Some(previous) = entry.idle_timer.take() {
            previous.abort();
        }

        let generation = entry.idle_generation;
        let id = session_id.clone();
        let tx = self.cmd_tx.clone();
        entry.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(IDLE_TIMEOUT).await;
            let _ = tx
                .send(SupervisorCommand::IdleTimeout {
                    session_id: id,
                    generation,
                })
                .await;
        }));
    }

    async fn handle_idle_timeout(&mut self, session_id: &SessionId, generation: u64) {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return;
        };
        if entry.idle_generation != generation || !entry.descriptor.is_running() {
            return; // stale timer
        }
        if let Some(transition) = entry.detector.idle_timeout(Instant::now()) {
            self.apply_transition(session_id, transition).await;
        }
    }

    /// Applies one detector transition: per-state time accounting,
    /// compaction counting, assistant-transcript capture, segment marking,
    /// event emission, and the one-shot task injection.
    async fn apply_transition(&mut self, session_id: &SessionId, transition: Transition) {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return;
        };

        let elapsed_ms = transition.previous_elapsed.as_millis() as u64;
        match transition.previous {
            DetailedState::Working => entry.descriptor.total_working_ms += elapsed_ms,
            DetailedState::Idle => entry.descriptor.total_idle_ms += elapsed_ms,
            DetailedState::PermissionNeeded => {
                entry.descriptor.total_permission_wait_ms += elapsed_ms
            }
            _ => {}
        }

        if transition.next == DetailedState::Compacting {
            entry.descriptor.compaction_count += 1;
        }

        if transition.previous == DetailedState::Working
            && transition.next == DetailedState::Idle
        {
            let slice = entry.scrollback.assistant_slice();
            entry.transcript.record_assistant(&slice);
        }

        if transition.next == DetailedState::Working {
            entry.scrollback.mark_assistant_start();
        }

        entry.descriptor.detailed_state = transition.next;
        if self.backend == BackendKind::Tmux {
            self.tmux.write_metadata(&entry.descriptor);
        }

        let pending_task = if transition.next == DetailedState::Idle {
            entry.pending_task.take()
        } else {
            None
        };

        debug!(
            %session_id,
            from = %transition.previous,
            to = %transition.next,
            "state changed"
        );

        self.publish(SessionEvent::StateChanged {
            session_id: session_id.clone(),
            state: transition.next,
            previous: transition.previous,
        });

        // One-shot auto-task: fires on the first idle transition, then the
        // registration is gone for good.
        if let Some(task) = pending_task {
            debug!(%session_id, "injecting initial task");
            let mut payload = task.into_bytes();
            payload.push(b'\r');
            if let Err(e) = self.handle_write(session_id, payload).await {
                warn!(%session_id, error = %e, "initial task injection failed");
            }
        }
    }

    /// Terminal-state update for a natural exit (direct PTY) or an exit
    /// sweep hit (tmux). The descriptor stays in the store until an
    /// explicit kill removes it.
    fn handle_driver_exit(&mut self, session_id: &SessionId, exit_code: Option<i32>) {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return; // killed concurrently; listeners already detached
        };
        if entry.descriptor.status == SessionStatus::Exited || entry.exit_emitted {
            return;
        }

        entry.stop_timers();
        entry.pending_task = None;
        entry.descriptor.mark_exited(exit_code);
        entry.exit_emitted = true;

        if self.backend == BackendKind::Tmux {
            self.tmux.remove_pipe(session_id);
            self.tmux.write_metadata(&entry.descriptor);
        }

        info!(%session_id, ?exit_code, "session exited");

        self.publish(SessionEvent::Exited {
            session_id: session_id.clone(),
            exit_code,
        });
    }

    /// One tmux exit-poll result: any managed running session whose name
    /// is absent from the daemon's list has exited (code unknown).
    async fn handle_exit_sweep(&mut self, live: HashSet<String>) {
        let gone: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, e)| {
                matches!(e.runtime, SessionRuntime::Tmux { .. })
                    && e.descriptor.is_running()
            })
            .filter(|(id, _)| !live.contains(&session_name(id)))
            .map(|(id, _)| id.clone())
            .collect();

        for id in gone {
            self.handle_driver_exit(&id, None);
        }
    }

    // ========================================================================
    // Recovery (tmux backend only)
    // ========================================================================

    /// Rediscovers sessions left over from a prior supervisor instance.
    pub(super) async fn recover(&mut self) {
        if self.backend != BackendKind::Tmux {
            return;
        }

        let ids = self.tmux.discover_sessions().await;
        if ids.is_empty() {
            return;
        }

        let mut recovered = 0u32;
        for id in ids {
            if self.sessions.contains_key(&id) {
                continue;
            }
            if self.recover_one(&id).await {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(recovered, "recovered sessions from previous instance");
        }
    }

    async fn recover_one(&mut self, id: &SessionId) -> bool {
        let pane_pid = self.tmux.pane_pid(id).await.ok().flatten();

        let mut descriptor = match self.tmux.load_metadata(id) {
            Some(mut desc) => {
                // Persisted status may say exited from a past shutdown;
                // the session demonstrably lives.
                desc.status = SessionStatus::Running;
                desc.detailed_state = DetailedState::Idle;
                desc.exit_code = None;
                desc
            }
            None => {
                let cwd = self
                    .tmux
                    .pane_cwd(id)
                    .await
                    .unwrap_or_else(|| Path::new("/").to_path_buf());
                let mut desc = SessionDescriptor::new(
                    id.clone(),
                    format!("recovered {id}"),
                    "recovered",
                    cwd,
                    DEFAULT_COLS,
                    DEFAULT_ROWS,
                );
                desc.detailed_state = DetailedState::Idle;
                desc
            }
        };
        descriptor.pid = pane_pid;

        // Recreate the tee; a session we cannot stream is skipped entirely.
        if let Err(e) = self.tmux.reattach_pipe(id).await {
            warn!(%id, error = %e, "pipe re-attach failed, skipping session");
            return false;
        }

        let poller =
            spawn_pipe_poller(id.clone(), self.tmux.pipe_path(id), self.driver_tx.clone());

        let mut detector = DetectorBlock::new(Instant::now());
        if let Ok(tail) = self.tmux.capture_tail(id, RECOVERY_BOOTSTRAP_LINES).await {
            let _ = detector.ingest(tail.as_bytes(), Instant::now());
        }
        if detector.state() != DetailedState::Starting {
            descriptor.detailed_state = detector.state();
        }

        self.tmux.write_metadata(&descriptor);

        self.sessions.insert(
            id.clone(),
            SessionEntry {
                descriptor,
                scrollback: Scrollback::new(),
                transcript: Transcript::new(self.transcript_max_entries),
                detector,
                runtime: SessionRuntime::Tmux { poller },
                pending_task: None,
                idle_generation: 0,
                idle_timer: None,
                exit_emitted: false,
            },
        );

        info!(%id, "session recovered");
        true
    }

    fn publish(&self, event: SessionEvent) {
        // Ignore send errors: no subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

/// Spawns the tmux exit poller: every 2 s, ask the daemon for its session
/// names and feed the result back into the actor. A stopped daemon means
/// every managed session is gone; transient failures are logged and
/// skipped without marking anything exited.
pub(super) fn spawn_exit_poller(
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(tmux::EXIT_POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("exit poller shutting down");
                    return;
                }

                _ = tick.tick() => {
                    match tmux::list_session_names().await {
                        Ok(tmux::SessionListing::Names(live)) => {
                            if cmd_tx
                                .send(SupervisorCommand::ExitSweep { live })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(tmux::SessionListing::NoServer) => {
                            if cmd_tx
                                .send(SupervisorCommand::ExitSweep {
                                    live: HashSet::new(),
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "exit poll failed, leaving sessions alone");
                        }
                    }
                }
            }
        }
    })
}
