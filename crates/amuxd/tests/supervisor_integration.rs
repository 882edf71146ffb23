//! Integration tests for the supervisor actor.
//!
//! These drive the real actor through its handle with the direct-PTY
//! backend pointed at small coreutils (`/bin/cat`, `/bin/echo`), and feed
//! synthetic driver output through the driver channel to exercise the
//! state detector paths deterministically.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use amux_core::{DetailedState, SessionId, SessionStatus};
use amux_core::transcript::Role;
use amuxd::config::Config;
use amuxd::driver::{BackendKind, DriverEvent};
use amuxd::supervisor::{
    spawn_supervisor, SessionEvent, SpawnOptions, SupervisorError, SupervisorHandle,
};

const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Test context holding the supervisor and its state directory.
struct TestSupervisor {
    handle: SupervisorHandle,
    _state_dir: TempDir,
}

impl TestSupervisor {
    /// Spawns a supervisor on the PTY backend with the given agent command.
    async fn start(agent_command: &str) -> Self {
        let state_dir = TempDir::new().expect("create state dir");
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            auth_token: "test-token-0123".to_string(),
            backend: amuxd::config::BackendSelector::Pty,
            skip_permissions_default: false,
            browse_enabled: false,
            extra_allowed_flags: Vec::new(),
            transcript_max_entries: 100,
            agent_command: agent_command.to_string(),
            state_dir: state_dir.path().to_path_buf(),
        };
        let handle = spawn_supervisor(&config, BackendKind::Pty).await;
        Self {
            handle,
            _state_dir: state_dir,
        }
    }

    fn spawn_opts() -> SpawnOptions {
        SpawnOptions {
            cwd: PathBuf::from("/tmp"),
            ..Default::default()
        }
    }

    /// Injects synthetic driver output for a session.
    async fn inject(&self, id: &SessionId, bytes: &[u8]) {
        self.handle
            .driver_sender()
            .send(DriverEvent::Output {
                session_id: id.clone(),
                bytes: bytes.to_vec(),
            })
            .await
            .expect("driver channel open");
    }
}

/// Waits for the next state change for `id`, returning (state, previous).
async fn next_state_change(
    rx: &mut broadcast::Receiver<SessionEvent>,
    id: &SessionId,
) -> (DetailedState, DetailedState) {
    loop {
        let event = timeout(EVENT_WAIT, rx.recv())
            .await
            .expect("timed out waiting for state change")
            .expect("event channel closed");
        if let SessionEvent::StateChanged {
            session_id,
            state,
            previous,
        } = event
        {
            if &session_id == id {
                return (state, previous);
            }
        }
    }
}

// ============================================================================
// Spawn
// ============================================================================

#[tokio::test]
async fn spawn_returns_fresh_descriptor() {
    let sup = TestSupervisor::start("/bin/cat").await;

    let desc = sup
        .handle
        .spawn(SpawnOptions {
            name: Some("test".to_string()),
            group: Some("g1".to_string()),
            ..TestSupervisor::spawn_opts()
        })
        .await
        .expect("spawn failed");

    assert_eq!(desc.id.as_str().len(), 8);
    assert_eq!(desc.name, "test");
    assert_eq!(desc.group, "g1");
    assert_eq!(desc.status, SessionStatus::Running);
    assert_eq!(desc.detailed_state, DetailedState::Starting);
    assert!(desc.task.is_none());
    assert_eq!(desc.compaction_count, 0);
    assert!(desc.pid.is_some());

    sup.handle.kill(desc.id).await;
}

#[tokio::test]
async fn auto_names_follow_the_counter_despite_kills() {
    let sup = TestSupervisor::start("/bin/cat").await;

    let first = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn 1");
    assert_eq!(first.name, "agent");

    // Kill the first before spawning more; the counter must not rewind.
    assert!(sup.handle.kill(first.id).await);

    let second = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn 2");
    let third = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn 3");
    assert_eq!(second.name, "agent 2");
    assert_eq!(third.name, "agent 3");

    sup.handle.kill_all().await;
}

#[tokio::test]
async fn spawn_rejects_bad_cwd() {
    let sup = TestSupervisor::start("/bin/cat").await;

    let err = sup
        .handle
        .spawn(SpawnOptions {
            cwd: PathBuf::from("/definitely/not/a/directory"),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidCwd { .. }));

    let err = sup
        .handle
        .spawn(SpawnOptions {
            cwd: PathBuf::from("relative/path"),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidCwd { .. }));
}

#[tokio::test]
async fn spawn_rejects_disallowed_args() {
    let sup = TestSupervisor::start("/bin/cat").await;

    let err = sup
        .handle
        .spawn(SpawnOptions {
            args: vec!["--unvetted-flag".to_string()],
            ..TestSupervisor::spawn_opts()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::DisallowedArg { .. }));

    // Allowed flags and positionals pass.
    let desc = sup
        .handle
        .spawn(SpawnOptions {
            args: vec![
                "--verbose".to_string(),
                "--model=opus".to_string(),
                "a-positional".to_string(),
            ],
            ..TestSupervisor::spawn_opts()
        })
        .await
        .expect("allow-listed argv must spawn");
    sup.handle.kill(desc.id).await;
}

// ============================================================================
// Write and transcript
// ============================================================================

#[tokio::test]
async fn write_records_one_user_transcript_entry() {
    let sup = TestSupervisor::start("/bin/cat").await;
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");

    sup.handle
        .write(desc.id.clone(), b"x\r".to_vec())
        .await
        .expect("write");

    let transcript = sup
        .handle
        .get_transcript(desc.id.clone())
        .await
        .expect("session known");
    let users: Vec<_> = transcript
        .iter()
        .filter(|e| e.role == Role::User)
        .collect();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].content, "x");

    sup.handle.kill(desc.id).await;
}

#[tokio::test]
async fn write_to_unknown_or_exited_session_fails() {
    let sup = TestSupervisor::start("/bin/echo").await;

    let err = sup
        .handle
        .write(SessionId::new("00000000"), b"hi".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::SessionNotFound(_)));

    // echo exits immediately; wait for the exit event, then writes fail.
    let mut rx = sup.handle.subscribe();
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");
    loop {
        let event = timeout(EVENT_WAIT, rx.recv())
            .await
            .expect("no exit event")
            .expect("channel");
        if let SessionEvent::Exited { session_id, .. } = event {
            if session_id == desc.id {
                break;
            }
        }
    }

    let err = sup
        .handle
        .write(desc.id.clone(), b"hi".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::NotRunning(_)));

    sup.handle.kill(desc.id).await;
}

// ============================================================================
// Detector-driven state transitions
// ============================================================================

#[tokio::test]
async fn prompt_output_drives_session_idle() {
    let sup = TestSupervisor::start("/bin/cat").await;
    let mut rx = sup.handle.subscribe();
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");

    sup.inject(&desc.id, "some output\n\u{276f} ".as_bytes()).await;

    let (state, previous) = next_state_change(&mut rx, &desc.id).await;
    assert_eq!(state, DetailedState::Idle);
    assert_eq!(previous, DetailedState::Starting);

    let info = sup.handle.get_session(desc.id.clone()).await.unwrap();
    assert_eq!(info.detailed_state, DetailedState::Idle);

    sup.handle.kill(desc.id).await;
}

#[tokio::test]
async fn permission_prompt_drives_permission_needed() {
    let sup = TestSupervisor::start("/bin/cat").await;
    let mut rx = sup.handle.subscribe();
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");

    sup.inject(
        &desc.id,
        b"Some context\nDo you want to proceed?\n(Y)es / No",
    )
    .await;

    let (state, _) = next_state_change(&mut rx, &desc.id).await;
    assert_eq!(state, DetailedState::PermissionNeeded);

    sup.handle.kill(desc.id).await;
}

#[tokio::test]
async fn assistant_reply_captured_on_working_to_idle() {
    let sup = TestSupervisor::start("/bin/cat").await;
    let mut rx = sup.handle.subscribe();
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");

    // Spinner puts the session in working and marks the segment start.
    sup.inject(&desc.id, "\x1b[36m\u{273b}\x1b[0m Thinking...".as_bytes())
        .await;
    let (state, _) = next_state_change(&mut rx, &desc.id).await;
    assert_eq!(state, DetailedState::Working);

    // Reply text, then the prompt returns: working -> idle captures the
    // slice since the segment start, control-stripped and trimmed.
    sup.inject(&desc.id, b"The answer is 42.\n").await;
    sup.inject(&desc.id, "\u{276f} ".as_bytes()).await;
    let (state, previous) = next_state_change(&mut rx, &desc.id).await;
    assert_eq!(previous, DetailedState::Working);
    assert_eq!(state, DetailedState::Idle);

    let transcript = sup.handle.get_transcript(desc.id.clone()).await.unwrap();
    let assistant: Vec<_> = transcript
        .iter()
        .filter(|e| e.role == Role::Assistant)
        .collect();
    assert_eq!(assistant.len(), 1);
    assert!(assistant[0].content.contains("The answer is 42."));

    sup.handle.kill(desc.id).await;
}

#[tokio::test(start_paused = true)]
async fn working_falls_idle_after_the_timeout() {
    let sup = TestSupervisor::start("/bin/cat").await;
    let mut rx = sup.handle.subscribe();
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");

    sup.inject(&desc.id, "\u{273b} Thinking\u{2026}".as_bytes()).await;
    let (state, _) = next_state_change(&mut rx, &desc.id).await;
    assert_eq!(state, DetailedState::Working);

    // No further output: the 30 s single-shot timer fires (virtual time).
    let event = timeout(Duration::from_secs(120), async {
        loop {
            if let Ok(SessionEvent::StateChanged {
                session_id,
                state,
                previous,
            }) = rx.recv().await
            {
                if session_id == desc.id {
                    return (state, previous);
                }
            }
        }
    })
    .await
    .expect("no idle timeout transition");
    assert_eq!(event, (DetailedState::Idle, DetailedState::Working));

    sup.handle.kill(desc.id).await;
}

// ============================================================================
// Auto-task injection
// ============================================================================

#[tokio::test]
async fn task_injected_exactly_once_on_first_idle() {
    let sup = TestSupervisor::start("/bin/cat").await;
    let mut rx = sup.handle.subscribe();
    let desc = sup
        .handle
        .spawn(SpawnOptions {
            task: Some("do the thing".to_string()),
            ..TestSupervisor::spawn_opts()
        })
        .await
        .expect("spawn");
    assert_eq!(desc.task.as_deref(), Some("do the thing"));

    // Drive the detector to idle; the pending task fires once.
    sup.inject(&desc.id, "\u{276f} ".as_bytes()).await;
    let (state, _) = next_state_change(&mut rx, &desc.id).await;
    assert_eq!(state, DetailedState::Idle);

    // The injected write lands in the transcript as a user entry.
    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    loop {
        let transcript = sup.handle.get_transcript(desc.id.clone()).await.unwrap();
        let users: Vec<_> = transcript
            .iter()
            .filter(|e| e.role == Role::User)
            .collect();
        if users.len() == 1 {
            assert_eq!(users[0].content, "do the thing");
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task was never injected"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // A second idle transition must not re-inject.
    sup.inject(&desc.id, "\u{273b} Working\u{2026}".as_bytes()).await;
    let (state, _) = next_state_change(&mut rx, &desc.id).await;
    assert_eq!(state, DetailedState::Working);
    sup.inject(&desc.id, "\u{276f} ".as_bytes()).await;
    let (state, _) = next_state_change(&mut rx, &desc.id).await;
    assert_eq!(state, DetailedState::Idle);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let transcript = sup.handle.get_transcript(desc.id.clone()).await.unwrap();
    let users = transcript
        .iter()
        .filter(|e| e.role == Role::User && e.content == "do the thing")
        .count();
    assert_eq!(users, 1, "task must fire exactly once");

    sup.handle.kill(desc.id).await;
}

// ============================================================================
// Exit and kill semantics
// ============================================================================

#[tokio::test]
async fn natural_exit_keeps_descriptor_until_kill() {
    let sup = TestSupervisor::start("/bin/echo").await;
    let mut rx = sup.handle.subscribe();
    let desc = sup
        .handle
        .spawn(SpawnOptions {
            args: vec!["goodbye".to_string()],
            ..TestSupervisor::spawn_opts()
        })
        .await
        .expect("spawn");

    let code = loop {
        let event = timeout(EVENT_WAIT, rx.recv())
            .await
            .expect("no exit event")
            .expect("channel");
        if let SessionEvent::Exited {
            session_id,
            exit_code,
        } = event
        {
            if session_id == desc.id {
                break exit_code;
            }
        }
    };
    assert_eq!(code, Some(0));

    // Descriptor stays until an explicit kill removes it.
    let info = sup.handle.get_session(desc.id.clone()).await.unwrap();
    assert_eq!(info.status, SessionStatus::Exited);
    assert_eq!(info.exit_code, Some(0));
    assert!(info.pid.is_none());

    assert!(sup.handle.kill(desc.id.clone()).await);
    assert!(sup.handle.get_session(desc.id.clone()).await.is_none());
    assert!(!sup.handle.kill(desc.id).await);
}

#[tokio::test]
async fn kill_after_natural_exit_emits_no_second_event() {
    let sup = TestSupervisor::start("/bin/echo").await;
    let mut rx = sup.handle.subscribe();
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");

    // Wait for the natural exit.
    loop {
        let event = timeout(EVENT_WAIT, rx.recv())
            .await
            .expect("no exit event")
            .expect("channel");
        if matches!(&event, SessionEvent::Exited { session_id, .. } if *session_id == desc.id)
        {
            break;
        }
    }

    // Removing the exited descriptor is silent.
    assert!(sup.handle.kill(desc.id.clone()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    loop {
        match rx.try_recv() {
            Ok(SessionEvent::Exited { session_id, .. }) => {
                assert_ne!(session_id, desc.id, "second terminal event emitted");
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn kill_running_session_emits_minus_one() {
    let sup = TestSupervisor::start("/bin/cat").await;
    let mut rx = sup.handle.subscribe();
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");

    assert!(sup.handle.kill(desc.id.clone()).await);

    let code = loop {
        let event = timeout(EVENT_WAIT, rx.recv())
            .await
            .expect("no exit event")
            .expect("channel");
        if let SessionEvent::Exited {
            session_id,
            exit_code,
        } = event
        {
            if session_id == desc.id {
                break exit_code;
            }
        }
    };
    assert_eq!(code, Some(-1));
    assert!(sup.handle.get_session(desc.id).await.is_none());
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn scrollback_reads_are_defensive_copies() {
    let sup = TestSupervisor::start("/bin/cat").await;
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");

    sup.inject(&desc.id, b"retained bytes").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut copy = sup
        .handle
        .get_scrollback(desc.id.clone())
        .await
        .expect("session known");
    assert!(copy.ends_with(b"retained bytes"));
    copy.clear();

    let again = sup.handle.get_scrollback(desc.id.clone()).await.unwrap();
    assert!(again.ends_with(b"retained bytes"));

    sup.handle.kill(desc.id).await;
}

#[tokio::test]
async fn groups_and_count_reflect_the_store() {
    let sup = TestSupervisor::start("/bin/cat").await;

    let a = sup
        .handle
        .spawn(SpawnOptions {
            group: Some("alpha".to_string()),
            ..TestSupervisor::spawn_opts()
        })
        .await
        .expect("spawn");
    let b = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");

    assert_eq!(sup.handle.count().await, 2);
    let groups = sup.handle.groups().await;
    assert!(groups.contains(&"alpha".to_string()));
    assert!(groups.contains(&"default".to_string()));

    sup.handle.kill(a.id).await;
    sup.handle.kill(b.id).await;
    assert_eq!(sup.handle.count().await, 0);
}

#[tokio::test]
async fn resize_clamps_and_updates_descriptor() {
    let sup = TestSupervisor::start("/bin/cat").await;
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");

    let (cols, rows) = sup
        .handle
        .resize(desc.id.clone(), Some(600.0), Some(0.0))
        .await
        .expect("resize");
    assert_eq!((cols, rows), (500, 1));

    // Absent values fall back to the current dimensions.
    let (cols, rows) = sup
        .handle
        .resize(desc.id.clone(), None, Some(40.7))
        .await
        .expect("resize");
    assert_eq!((cols, rows), (500, 41));

    let info = sup.handle.get_session(desc.id.clone()).await.unwrap();
    assert_eq!((info.cols, info.rows), (500, 41));

    sup.handle.kill(desc.id).await;
}

#[tokio::test]
async fn set_task_updates_descriptor() {
    let sup = TestSupervisor::start("/bin/cat").await;
    let desc = sup
        .handle
        .spawn(TestSupervisor::spawn_opts())
        .await
        .expect("spawn");
    let before = desc.task_started_at;

    tokio::time::sleep(Duration::from_millis(10)).await;
    sup.handle
        .set_task(desc.id.clone(), "new objective".to_string())
        .await
        .expect("set task");

    let info = sup.handle.get_session(desc.id.clone()).await.unwrap();
    assert_eq!(info.task.as_deref(), Some("new objective"));
    assert!(info.task_started_at > before);

    sup.handle.kill(desc.id).await;
}
