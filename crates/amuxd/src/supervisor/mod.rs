//! Session supervisor using the actor pattern.
//!
//! The supervisor is the canonical owner of all session state. It receives
//! commands via a tokio mpsc channel, receives driver push events via a
//! second channel, and publishes [`SessionEvent`]s on a broadcast channel
//! consumed by the fan-out bridge and other collaborators.

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

mod actor;
mod commands;
mod handle;

pub use commands::{
    SessionEvent, SessionMetrics, SpawnOptions, SupervisorCommand, SupervisorError,
};
pub use handle::SupervisorHandle;

use actor::{spawn_exit_poller, SupervisorActor};

use crate::config::Config;
use crate::driver::tmux::TmuxBackend;
use crate::driver::BackendKind;

/// Channel buffer sizes.
const COMMAND_BUFFER: usize = 256;
const DRIVER_BUFFER: usize = 1024;
const EVENT_BUFFER: usize = 1024;

/// Spawns the supervisor actor and returns a handle for interaction.
///
/// With the tmux backend this also runs the recovery path (rehydrating
/// sessions left over from a prior instance) before the actor starts
/// serving commands, and spawns the 2 s exit poller.
pub async fn spawn_supervisor(config: &Config, backend: BackendKind) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (driver_tx, driver_rx) = mpsc::channel(DRIVER_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let exit_poll_cancel = CancellationToken::new();

    let mut actor = SupervisorActor::new(
        cmd_rx,
        driver_rx,
        cmd_tx.clone(),
        driver_tx.clone(),
        event_tx.clone(),
        backend,
        TmuxBackend::new(config.state_dir.clone()),
        amux_core::ArgvPolicy::new(&config.extra_allowed_flags),
        config.agent_command.clone(),
        config.skip_permissions_default,
        config.transcript_max_entries,
        exit_poll_cancel.clone(),
    );

    if backend == BackendKind::Tmux {
        actor.recover().await;
        spawn_exit_poller(cmd_tx.clone(), exit_poll_cancel);
    }

    tokio::spawn(actor.run());

    SupervisorHandle::new(cmd_tx, event_tx, driver_tx)
}
