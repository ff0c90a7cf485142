//! Agent configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use pt_protocol::MultiplexerType;

use super::serde_utils::{duration_secs, multiplexer_name};
use crate::error::ConfigError;

/// Configuration for the desktop agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address the agent listens on for client connections.
    ///
    /// TLS is expected to be terminated in front of this socket.
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent client connections
    pub max_connections: usize,

    /// Maximum number of sessions a single connection may own
    pub max_sessions_per_connection: usize,

    /// Maximum number of sessions across all connections
    pub max_total_sessions: usize,

    /// Read idle timeout after which a silent connection is treated as dropped
    #[serde(with = "duration_secs")]
    pub disconnect_timeout: Duration,

    /// How long a disconnected session stays eligible for reconnection
    pub reconnection_window_minutes: u64,

    /// Interval between expiry sweeps
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,

    /// Backend used when a create request does not name one
    #[serde(with = "multiplexer_name")]
    pub preferred_multiplexer: MultiplexerType,

    /// Shells clients may request. Empty means any executable shell.
    pub allowed_shells: Vec<PathBuf>,

    /// Extra arguments per shell, keyed by full path or bare executable name
    pub shell_args: HashMap<String, Vec<String>>,

    /// Start shells as login shells
    pub login_shell: bool,

    /// Environment applied to every session before request overrides
    pub default_env: Vec<(String, String)>,

    /// Shared secret clients must present with `authenticate`.
    ///
    /// When unset, connections are considered authenticated by the
    /// hosting transport.
    pub auth_token: Option<String>,

    /// Where disconnected sessions are persisted across agent restarts
    pub state_file: Option<PathBuf>,

    /// Number of clipboard entries retained in memory
    pub clipboard_history_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 7681)),
            max_connections: 10,
            max_sessions_per_connection: 10,
            max_total_sessions: 50,
            disconnect_timeout: Duration::from_secs(90),
            reconnection_window_minutes: 30,
            cleanup_interval: Duration::from_secs(60),
            preferred_multiplexer: MultiplexerType::Native,
            allowed_shells: vec![],
            shell_args: HashMap::new(),
            login_shell: false,
            default_env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            auth_token: None,
            state_file: None,
            clipboard_history_limit: 50,
        }
    }
}

impl AgentConfig {
    /// Check limits for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("max_connections", self.max_connections),
            ("max_sessions_per_connection", self.max_sessions_per_connection),
            ("max_total_sessions", self.max_total_sessions),
            ("clipboard_history_limit", self.clipboard_history_limit),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
            }
        }

        if self.max_sessions_per_connection > self.max_total_sessions {
            return Err(ConfigError::Invalid(format!(
                "max_sessions_per_connection ({}) exceeds max_total_sessions ({})",
                self.max_sessions_per_connection, self.max_total_sessions
            )));
        }

        if self.reconnection_window_minutes == 0 {
            return Err(ConfigError::Invalid(
                "reconnection_window_minutes must be at least 1".to_string(),
            ));
        }

        if self.cleanup_interval.is_zero() || self.disconnect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "cleanup_interval and disconnect_timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Reconnection window as a duration
    pub fn reconnection_window(&self) -> Duration {
        Duration::from_secs(self.reconnection_window_minutes.saturating_mul(60))
    }

    /// Whether clients must send `authenticate` before anything else
    pub fn requires_auth(&self) -> bool {
        self.auth_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address.port(), 7681);
        assert_eq!(config.reconnection_window(), Duration::from_secs(30 * 60));
        assert!(!config.requires_auth());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = AgentConfig {
            max_total_sessions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_per_connection_above_global() {
        let config = AgentConfig {
            max_sessions_per_connection: 20,
            max_total_sessions: 5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            bind_address = "127.0.0.1:9000"
            max_total_sessions = 4
            max_sessions_per_connection = 2
            preferred_multiplexer = "tmux"
            cleanup_interval = 5

            [shell_args]
            zsh = ["--no-rcs"]
        "#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.bind_address.port(), 9000);
        assert_eq!(config.max_total_sessions, 4);
        assert_eq!(config.preferred_multiplexer, MultiplexerType::Tmux);
        assert_eq!(config.cleanup_interval, Duration::from_secs(5));
        assert_eq!(config.shell_args["zsh"], vec!["--no-rcs".to_string()]);
        // untouched fields keep defaults
        assert_eq!(config.max_connections, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_multiplexer_rejected() {
        let result: Result<AgentConfig, _> = toml::from_str(r#"preferred_multiplexer = "zellij""#);
        assert!(result.is_err());
    }
}
