//! Domain-specific error types.

use crate::SessionId;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// Working directory missing or not a directory
    #[error("invalid working directory: {path}")]
    InvalidCwd { path: String },

    /// Argument rejected by the spawn allow-list
    #[error("argument not allowed: {arg}")]
    DisallowedArg { arg: String },

    /// Session not found in the store
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    /// Session ceiling reached
    #[error("session limit reached (max: {max})")]
    AtCapacity { max: usize },

    /// Malformed caller input
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
