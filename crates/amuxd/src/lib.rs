//! amux daemon - multi-session supervisor for terminal agents.
//!
//! This crate provides the daemon infrastructure:
//! - `driver` - backend drivers (direct PTY and tmux) owning the agent's
//!   terminal
//! - `supervisor` - the session supervisor actor: canonical owner of all
//!   session state
//! - `bridge` - the streaming fan-out bridge multiplexing events to
//!   WebSocket clients
//! - `control` - the HTTP control surface
//! - `config` - startup configuration
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   commands    ┌──────────────────┐
//! │ control (HTTP)│─────────────▶│ SupervisorActor  │◀── driver events
//! └──────────────┘               │ (session store,  │    (output, exit,
//! ┌──────────────┐   subscribe   │  detector feed)  │     poll ticks)
//! │ bridge (WS)  │◀──────────────│  broadcast::Sender│
//! └──────┬───────┘    events     └──────────────────┘
//!        │ coalesced frames
//!        ▼
//!   subscribed clients
//! ```
//!
//! All session state mutates inside the supervisor actor; driver I/O and
//! subprocess invocations run on helper tasks that re-enter the actor
//! through its command channel.

pub mod bridge;
pub mod config;
pub mod control;
pub mod driver;
pub mod supervisor;
