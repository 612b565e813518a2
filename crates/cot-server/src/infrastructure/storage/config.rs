//! TOML-based configuration for the relay.
//!
//! The relay reads one file, `cot-relay.toml` in the working directory
//! unless `--config` says otherwise.  Every field has a default, so an absent
//! file or an absent section is fine:
//!
//! ```toml
//! [server]
//! uid = "relay-north"
//!
//! [network]
//! tcp_port = 8087
//! upstream = "10.0.0.5:8087"
//!
//! [session]
//! idle_timeout_secs = 300
//!
//! [routing]
//! interscope_chat = true
//! structured_tags = ["contact", "status", "track"]
//! ```
//!
//! Fields annotated with `#[serde(default = "some_fn")]` take the value of
//! `some_fn()` when they are missing from the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cot_core::{Codec, StructuredTag};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::session::SessionSettings;

/// File name used when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "cot-relay.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The config parsed but holds values the relay cannot run with.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Uid this relay uses in its own pings.
    #[serde(default = "default_uid")]
    pub uid: String,
}

/// Listener and upstream addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// IP address to bind the listener to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port for CoT clients.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Optional relay to connect to, `host:port` or `host:port:tcp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
}

/// Per-connection limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Outbound messages buffered per session before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_tag_len")]
    pub max_tag_len: usize,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Route pings to other sessions after answering them.
    #[serde(default)]
    pub route_pings: bool,
}

/// Routing behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// Deliver chat across scopes with coordinates removed.
    #[serde(default)]
    pub interscope_chat: bool,
    /// Scope assigned to accepted connections.
    #[serde(default)]
    pub default_scope: String,
    /// Detail tags the codec moves into typed binary fields.
    #[serde(default = "default_structured_tags")]
    pub structured_tags: Vec<StructuredTag>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_uid() -> String {
    "cot-relay".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_tcp_port() -> u16 {
    8087
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_ping_interval_secs() -> u64 {
    15
}
fn default_queue_capacity() -> usize {
    10
}
fn default_max_tag_len() -> usize {
    cot_core::protocol::DEFAULT_MAX_TAG_LEN
}
fn default_max_frame_len() -> usize {
    cot_core::protocol::DEFAULT_MAX_FRAME_LEN
}
fn default_structured_tags() -> Vec<StructuredTag> {
    StructuredTag::ALL.to_vec()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            uid: default_uid(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            tcp_port: default_tcp_port(),
            upstream: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            queue_capacity: default_queue_capacity(),
            max_tag_len: default_max_tag_len(),
            max_frame_len: default_max_frame_len(),
            route_pings: false,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            interscope_chat: false,
            default_scope: String::new(),
            structured_tags: default_structured_tags(),
        }
    }
}

impl AppConfig {
    /// Session tunables derived from the `[session]` and `[routing]` tables.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            ping_interval: Duration::from_secs(self.session.ping_interval_secs),
            queue_capacity: self.session.queue_capacity.max(1),
            max_tag_len: self.session.max_tag_len,
            max_frame_len: self.session.max_frame_len,
            route_pings: self.session.route_pings,
            interscope_chat: self.routing.interscope_chat,
        }
    }

    /// Checks values that parse but cannot work together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the ping interval is zero or not
    /// shorter than the idle timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.ping_interval_secs must be at least 1".to_string(),
            ));
        }
        if session.ping_interval_secs >= session.idle_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "session.ping_interval_secs ({}) must be shorter than session.idle_timeout_secs ({})",
                session.ping_interval_secs, session.idle_timeout_secs
            )));
        }
        Ok(())
    }

    /// Codec configured with the `structured_tags` lift set.
    pub fn codec(&self) -> Codec {
        Codec::new(self.routing.structured_tags.iter().copied())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed and
/// [`ConfigError::Invalid`] if [`AppConfig::validate`] rejects it.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: AppConfig = toml::from_str(&content)?;
            cfg.validate()?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("cot_relay_{tag}_{}", std::process::id()))
            .join("cot-relay.toml")
    }

    #[test]
    fn test_app_config_default_values() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.server.log_level, "info");
        assert_eq!(cfg.server.uid, "cot-relay");
        assert_eq!(cfg.network.tcp_port, 8087);
        assert_eq!(cfg.network.upstream, None);
        assert_eq!(cfg.session.queue_capacity, 10);
        assert_eq!(cfg.session.max_tag_len, 8192);
        assert!(!cfg.routing.interscope_chat);
        assert_eq!(cfg.routing.structured_tags.len(), StructuredTag::ALL.len());
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_deserialize_partial_tables_override_defaults() {
        // Arrange
        let toml_str = r#"
[network]
tcp_port = 9999
upstream = "10.0.0.5:8087"

[routing]
interscope_chat = true
structured_tags = ["contact", "__group"]
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.network.tcp_port, 9999);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
        assert_eq!(cfg.network.upstream.as_deref(), Some("10.0.0.5:8087"));
        assert!(cfg.routing.interscope_chat);
        assert_eq!(
            cfg.routing.structured_tags,
            vec![StructuredTag::Contact, StructuredTag::Group]
        );
        // Unspecified tables keep their defaults
        assert_eq!(cfg.session.idle_timeout_secs, 300);
    }

    #[test]
    fn test_deserialize_unknown_structured_tag_is_parse_error() {
        let result: Result<AppConfig, toml::de::Error> =
            toml::from_str("[routing]\nstructured_tags = [\"remarks\"]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_session_settings_maps_seconds_and_flags() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.session.idle_timeout_secs = 2;
        cfg.session.ping_interval_secs = 1;
        cfg.session.queue_capacity = 0;
        cfg.routing.interscope_chat = true;

        // Act
        let settings = cfg.session_settings();

        // Assert
        assert_eq!(settings.idle_timeout, Duration::from_secs(2));
        assert_eq!(settings.ping_interval, Duration::from_secs(1));
        assert_eq!(settings.queue_capacity, 1, "capacity is clamped to one");
        assert!(settings.interscope_chat);
        assert!(!settings.route_pings);
    }

    #[test]
    fn test_codec_uses_configured_lift_set() {
        let mut cfg = AppConfig::default();
        cfg.routing.structured_tags = vec![StructuredTag::Track];
        assert_eq!(cfg.codec().structured_tags(), &[StructuredTag::Track]);
    }

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/cot-relay.toml");
        let cfg = load_config(&path).expect("absent file is not an error");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_load_config_reports_parse_error() {
        // Arrange
        let path = temp_path("bad");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        // Act
        let result = load_config(&path);

        // Assert
        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_ping_interval() {
        let mut cfg = AppConfig::default();
        cfg.session.ping_interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_ping_interval_not_below_idle_timeout() {
        let mut cfg = AppConfig::default();
        cfg.session.idle_timeout_secs = 30;

        cfg.session.ping_interval_secs = 30;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        cfg.session.ping_interval_secs = 45;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        cfg.session.ping_interval_secs = 29;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_config_rejects_zero_ping_interval() {
        // Arrange
        let path = temp_path("zero_ping");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[session]\nping_interval_secs = 0\n").unwrap();

        // Act
        let result = load_config(&path);

        // Assert
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_save_and_load_config_round_trip() {
        // Arrange
        let path = temp_path("roundtrip");
        let mut cfg = AppConfig::default();
        cfg.network.tcp_port = 12345;
        cfg.server.log_level = "debug".to_string();
        cfg.network.upstream = Some("peer:8087".to_string());

        // Act
        save_config(&path, &cfg).expect("save");
        let loaded = load_config(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
