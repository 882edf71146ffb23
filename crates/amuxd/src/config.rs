//! Daemon configuration, resolved once at startup from the environment.

use std::env;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use amux_core::limits::DEFAULT_TRANSCRIPT_MAX_ENTRIES;

/// Environment variable carrying the auth token.
pub const TOKEN_ENV: &str = "AMUX_TOKEN";
/// Environment variable overriding the bind address.
pub const HOST_ENV: &str = "AMUX_HOST";
/// Environment variable overriding the port.
pub const PORT_ENV: &str = "AMUX_PORT";

/// Variables stripped from every spawned agent's environment.
pub const SENSITIVE_ENV_VARS: &[&str] = &[TOKEN_ENV, HOST_ENV, PORT_ENV];

/// Default bind address and port.
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 18900;

/// Minimum accepted auth token length.
const MIN_TOKEN_LEN: usize = 8;

/// Which backend hosts agent sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelector {
    /// Sessions live in a tmux server and survive daemon restarts.
    Tmux,
    /// Sessions are direct children on a supervisor-owned PTY.
    Pty,
    /// Prefer tmux when the daemon binary is installed, else PTY.
    Auto,
}

impl BackendSelector {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tmux" => Ok(Self::Tmux),
            "pty" => Ok(Self::Pty),
            "auto" | "" => Ok(Self::Auto),
            other => Err(ConfigError::InvalidBackend {
                value: other.to_string(),
            }),
        }
    }
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub auth_token: String,
    pub backend: BackendSelector,
    pub skip_permissions_default: bool,
    pub browse_enabled: bool,
    pub extra_allowed_flags: Vec<String>,
    pub transcript_max_entries: usize,
    /// Command used to launch the agent.
    pub agent_command: String,
    /// Per-user state directory (metadata, pipes, pid file).
    pub state_dir: PathBuf,
}

impl Config {
    /// Reads configuration from the environment, generating an auth token
    /// when none is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var(HOST_ENV).unwrap_or_else(|_| DEFAULT_HOST.to_string());

        let port = match env::var(PORT_ENV) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort { value: raw })?,
            Err(_) => DEFAULT_PORT,
        };

        let auth_token = match env::var(TOKEN_ENV) {
            Ok(token) => {
                if token.len() < MIN_TOKEN_LEN {
                    return Err(ConfigError::TokenTooShort {
                        min: MIN_TOKEN_LEN,
                    });
                }
                token
            }
            // 16 random bytes, hex-encoded.
            Err(_) => Uuid::new_v4().simple().to_string(),
        };

        let backend = BackendSelector::parse(
            &env::var("AMUX_BACKEND").unwrap_or_default(),
        )?;

        let skip_permissions_default = env_flag("AMUX_SKIP_PERMISSIONS");
        let browse_enabled = env_flag("AMUX_BROWSE");

        let extra_allowed_flags = env::var("AMUX_ALLOWED_FLAGS")
            .map(|raw| {
                raw.split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let transcript_max_entries = env::var("AMUX_TRANSCRIPT_MAX")
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(DEFAULT_TRANSCRIPT_MAX_ENTRIES);

        let agent_command =
            env::var("AMUX_AGENT").unwrap_or_else(|_| "claude".to_string());

        let state_dir = env::var("AMUX_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_state_dir());

        Ok(Self {
            host,
            port,
            auth_token,
            backend,
            skip_permissions_default,
            browse_enabled,
            extra_allowed_flags,
            transcript_max_entries,
            agent_command,
            state_dir,
        })
    }
}

/// Default per-user state directory.
pub fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("amux")
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("auth token must be at least {min} characters")]
    TokenTooShort { min: usize },

    #[error("invalid port: {value}")]
    InvalidPort { value: String },

    #[error("invalid backend selector: {value} (expected tmux|pty|auto)")]
    InvalidBackend { value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_selector_parses() {
        assert_eq!(BackendSelector::parse("tmux").unwrap(), BackendSelector::Tmux);
        assert_eq!(BackendSelector::parse("PTY").unwrap(), BackendSelector::Pty);
        assert_eq!(BackendSelector::parse("auto").unwrap(), BackendSelector::Auto);
        assert_eq!(BackendSelector::parse("").unwrap(), BackendSelector::Auto);
        assert!(BackendSelector::parse("docker").is_err());
    }

    #[test]
    fn generated_token_is_long_enough() {
        // 32 hex chars from 16 random bytes.
        let token = Uuid::new_v4().simple().to_string();
        assert_eq!(token.len(), 32);
        assert!(token.len() >= MIN_TOKEN_LEN);
    }
}
