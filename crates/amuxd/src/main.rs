//! amuxd - multi-session agent supervisor daemon
//!
//! Spawns, observes, and multiplexes interactive terminal agents over a
//! direct-PTY or tmux backend, exposing an HTTP control surface and a
//! WebSocket streaming surface.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! amuxd start
//!
//! # Start the daemon (background/daemonized)
//! amuxd start -d
//!
//! # Stop the daemon
//! amuxd stop
//!
//! # Check daemon status
//! amuxd status
//!
//! # Pick the backend explicitly
//! AMUX_BACKEND=pty amuxd start
//!
//! # Enable debug logging
//! RUST_LOG=amuxd=debug amuxd start
//! ```
//!
//! # Signal Handling
//!
//! SIGTERM/SIGINT trigger graceful shutdown: the exit poller stops, every
//! session is killed, the bridge closes, and runtime files are removed.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use amuxd::bridge::ws::{self, WsState};
use amuxd::bridge::spawn_bridge;
use amuxd::config::{default_state_dir, Config};
use amuxd::control::{self, ControlState, IpRateLimiter};
use amuxd::driver::BackendKind;
use amuxd::supervisor::spawn_supervisor;

/// amux daemon - terminal agent session supervisor
#[derive(Parser, Debug)]
#[command(name = "amuxd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn pid_file_path() -> PathBuf {
    default_state_dir().join("amuxd.pid")
}

fn log_file_path() -> PathBuf {
    default_state_dir().join("amuxd.log")
}

/// Connection file advertising the control endpoint to local clients.
fn connection_file_path() -> PathBuf {
    default_state_dir().join("amuxd.json")
}

fn read_pid() -> Option<u32> {
    let mut contents = String::new();
    File::open(pid_file_path())
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("failed to create state directory")?;
    }
    let mut file = File::create(&path).context("failed to create PID file")?;
    write!(file, "{}", process::id()).context("failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file(); // stale PID file
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if result != 0 {
        bail!("failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("daemon is already running (PID {pid})");
                eprintln!("use 'amuxd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon();
            remove_pid_file();
            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("daemon is running (PID {pid})");
                if let Ok(raw) = fs::read_to_string(connection_file_path()) {
                    println!("endpoint: {}", raw.trim());
                }
                Ok(())
            } else {
                println!("daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("failed to create log file")?;
    let stderr = File::create(&log_path).context("failed to create log file")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("amuxd=info".parse()?)
                .add_directive("amux_core=info".parse()?),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let backend = BackendKind::resolve(config.backend)
        .context("backend unavailable")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        ?backend,
        "amux daemon starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "error waiting for shutdown signal");
        }
        info!("shutdown signal received");
        shutdown_token.cancel();
    });

    // Supervisor (including recovery of tmux sessions from a prior run).
    let supervisor = spawn_supervisor(&config, backend).await;
    info!("supervisor started");

    // Streaming fan-out bridge; a handle is kept for graceful shutdown.
    let bridge = spawn_bridge(supervisor.clone());
    let bridge_shutdown = bridge.clone();

    // HTTP + WS surfaces on one listener.
    let control_state = Arc::new(ControlState {
        supervisor: supervisor.clone(),
        auth_token: config.auth_token.clone(),
        browse_enabled: config.browse_enabled,
        rate_limiter: IpRateLimiter::default(),
    });
    let ws_state = Arc::new(WsState::new(
        bridge,
        supervisor.clone(),
        config.auth_token.clone(),
    ));

    let app = control::routes(control_state).merge(ws::routes(ws_state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;

    write_connection_file(local_addr)?;
    info!(addr = %local_addr, "serving control and streaming surfaces");

    let server_cancel = cancel_token.clone();
    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        server_cancel.cancelled().await;
    })
    .await;

    // Shutdown ordering: the supervisor stops the exit poller before
    // iterating sessions, every session is killed, the bridge closes its
    // clients, then the connection file goes away.
    supervisor.kill_all().await;
    bridge_shutdown.shutdown().await;
    let _ = fs::remove_file(connection_file_path());

    if let Err(e) = serve_result {
        error!(error = %e, "server error");
        bail!("server error: {e}");
    }

    info!("amux daemon stopped");
    Ok(())
}

fn write_connection_file(addr: SocketAddr) -> Result<()> {
    let path = connection_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::json!({
        "host": addr.ip().to_string(),
        "port": addr.port(),
        "pid": process::id(),
    });
    fs::write(&path, serde_json::to_string_pretty(&body)?)?;
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    Ok(())
}
