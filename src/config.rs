//! Configuration for both ends of the protocol.
//!
//! Read from a JSON file given on the command line, else from the
//! `PROFILER_WIRE_CONFIG` environment variable holding JSON, else defaults.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::session::SessionConfig;
use crate::transport::ChannelConfig;
use crate::version::{ProtocolVersion, CURRENT_PROTOCOL_VERSION, MIN_SUPPORTED_AGENT_VERSION};
use crate::wire::DEFAULT_MAX_FRAME_SIZE;

/// Environment variable holding the configuration as JSON.
pub const CONFIG_ENV: &str = "PROFILER_WIRE_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Revision this side implements. Agents report it during negotiation.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: ProtocolVersion,

    /// Oldest agent revision a controller will talk to.
    #[serde(default = "default_min_agent_version")]
    pub min_agent_version: ProtocolVersion,

    /// Largest frame payload, in bytes, accepted or sent.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,

    /// Identifier an agent reports to controllers.
    #[serde(default)]
    pub agent_id: i32,

    /// Controller session tuning (optional).
    #[serde(default)]
    pub session: Option<SessionSettings>,
}

/// Controller session settings (as read from JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// How long to wait for a TCP connection to the agent.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// How long the agent has to answer the VM properties request.
    #[serde(default = "default_negotiate_timeout")]
    pub negotiate_timeout_seconds: u64,

    /// Deadline for ordinary command replies. Unset waits indefinitely.
    #[serde(default)]
    pub response_timeout_seconds: Option<u64>,

    /// Events buffered before new ones are dropped.
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            min_agent_version: default_min_agent_version(),
            max_frame_size: default_max_frame_size(),
            agent_id: 0,
            session: None,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            negotiate_timeout_seconds: default_negotiate_timeout(),
            response_timeout_seconds: None,
            event_queue_depth: default_event_queue_depth(),
        }
    }
}

impl Config {
    /// Load from `path` if given, else from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    /// Load from the `PROFILER_WIRE_CONFIG` environment variable, falling back
    /// to defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        let json = match std::env::var(CONFIG_ENV) {
            Ok(json) => json,
            Err(std::env::VarError::NotPresent) => {
                debug!("{CONFIG_ENV} not set, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {CONFIG_ENV}")),
        };

        let config: Self =
            serde_json::from_str(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.max_frame_size > 0 && i32::try_from(self.max_frame_size).is_ok(),
            "max_frame_size must be between 1 and {}, got {}",
            i32::MAX,
            self.max_frame_size
        );
        anyhow::ensure!(
            self.protocol_version <= CURRENT_PROTOCOL_VERSION,
            "protocol_version {} is newer than this build implements ({})",
            self.protocol_version,
            CURRENT_PROTOCOL_VERSION
        );
        anyhow::ensure!(
            self.min_agent_version <= self.protocol_version,
            "min_agent_version {} is newer than protocol_version {}",
            self.min_agent_version,
            self.protocol_version
        );
        Ok(())
    }

    pub const fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            protocol_version: self.protocol_version,
            max_frame_size: self.max_frame_size,
        }
    }

    /// Session settings: the JSON block if present, else environment overrides.
    pub fn session_config(&self) -> SessionConfig {
        let config = self
            .session
            .as_ref()
            .map_or_else(SessionConfig::from_env, SessionConfig::from_settings);
        SessionConfig {
            min_agent_version: self.min_agent_version,
            ..config
        }
    }
}

const fn default_protocol_version() -> ProtocolVersion {
    CURRENT_PROTOCOL_VERSION
}

const fn default_min_agent_version() -> ProtocolVersion {
    MIN_SUPPORTED_AGENT_VERSION
}

const fn default_max_frame_size() -> u32 {
    DEFAULT_MAX_FRAME_SIZE
}

const fn default_connect_timeout() -> u64 {
    10
}

const fn default_negotiate_timeout() -> u64 {
    30
}

const fn default_event_queue_depth() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.protocol_version, CURRENT_PROTOCOL_VERSION);
        assert_eq!(config.min_agent_version, MIN_SUPPORTED_AGENT_VERSION);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.agent_id, 0);
        assert!(config.session.is_none());
        assert_eq!(config.channel_config(), ChannelConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "protocol_version": 6,
            "min_agent_version": 4,
            "max_frame_size": 1048576,
            "agent_id": 12,
            "session": {
                "negotiate_timeout_seconds": 5,
                "response_timeout_seconds": 60,
                "event_queue_depth": 16
            }
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.protocol_version, ProtocolVersion(6));
        assert_eq!(config.agent_id, 12);

        let channel = config.channel_config();
        assert_eq!(channel.max_frame_size, 1_048_576);

        let session = config.session_config();
        assert_eq!(session.connect_timeout, Duration::from_secs(10));
        assert_eq!(session.negotiate_timeout, Duration::from_secs(5));
        assert_eq!(session.response_timeout, Some(Duration::from_secs(60)));
        assert_eq!(session.event_queue_depth, 16);
        assert_eq!(session.min_agent_version, ProtocolVersion(4));
    }

    #[test]
    fn rejects_min_version_above_own() {
        let err = Config::from_json(r#"{"protocol_version": 4, "min_agent_version": 5}"#)
            .unwrap_err();
        assert!(err.to_string().contains("min_agent_version"));
    }

    #[test]
    fn rejects_revision_newer_than_build() {
        let err = Config::from_json(r#"{"protocol_version": 12}"#).unwrap_err();
        assert!(err.to_string().contains("protocol_version"));
        assert!(Config::from_json(r#"{"protocol_version": 8}"#).is_ok());
    }

    #[test]
    fn rejects_zero_frame_size() {
        assert!(Config::from_json(r#"{"max_frame_size": 0}"#).is_err());
        assert!(Config::from_json(r#"{"max_frame_size": 4294967295}"#).is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"agent_id": 3, "session": {{}}}}"#).unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.agent_id, 3);
        let session = config.session.unwrap();
        assert_eq!(session.negotiate_timeout_seconds, 30);
        assert_eq!(session.response_timeout_seconds, None);
        assert_eq!(session.event_queue_depth, 256);
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
