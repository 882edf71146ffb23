//! amux protocol - wire frames for the streaming surface.
//!
//! This crate defines the JSON frames exchanged over the `/ws` streaming
//! surface between the daemon and its subscribed clients.

pub mod message;

pub use message::{ClientFrame, DaemonFrame, MAX_INPUT_BYTES};
