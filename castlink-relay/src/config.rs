//! Relay configuration.
//!
//! Loaded from a TOML file. The binary layers [`ConfigOverrides`] from its
//! command line (or the matching environment variables) on top.
//!
//! The emitter and admin paths are the only access control the relay has,
//! so a first run writes a file with freshly generated, unguessable paths.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ids::create_id;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind the HTTP/WebSocket listener to
    pub bind_addr: String,
    /// Base URL used when building receiver URLs for the scene tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
    /// Exact paths accepted as emitter sockets
    pub emitter_paths: Vec<String>,
    /// Exact paths accepted as admin sockets
    pub admin_paths: Vec<String>,
    /// Receivers connect to `<receiver_prefix><emitter id>`
    pub receiver_prefix: String,
    /// Upload and recording channels live under `<record_prefix><token>`
    pub record_prefix: String,
    pub recordings_folder: PathBuf,
    /// Hand every receiver a recording URL
    pub record: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_delay: Option<f64>,
    /// Ping interval; a socket silent for a whole interval is terminated
    pub heartbeat_interval_secs: u64,
    /// Delay before a closed socket's record URL and upload grants are released
    pub release_cooldown_ms: u64,
    /// JSONL activity log, disabled when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_log: Option<PathBuf>,
    /// Passed verbatim to `createRTCConnection`
    pub rtc_configuration: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_constraints: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_options: Option<Value>,
}

/// Values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_addr: Option<String>,
    pub recordings_folder: Option<PathBuf>,
    pub activity_log: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            public_base_url: None,
            emitter_paths: vec!["/emitter/".to_string()],
            admin_paths: vec!["/admin/".to_string()],
            receiver_prefix: "/receiver/".to_string(),
            record_prefix: "/record/".to_string(),
            recordings_folder: PathBuf::from("recordings"),
            record: false,
            target_delay: None,
            heartbeat_interval_secs: 30,
            release_cooldown_ms: 1000,
            activity_log: None,
            rtc_configuration: json!({}),
            media_constraints: Some(json!({
                "audio": true,
                "video": {"width": 1280, "height": 720},
            })),
            record_options: None,
        }
    }
}

impl ServerConfig {
    /// Defaults with unguessable paths and prefixes, for a first run.
    pub fn generated() -> Self {
        Self {
            emitter_paths: vec![format!("/{}/", create_id())],
            admin_paths: vec![format!("/{}/", create_id())],
            receiver_prefix: format!("/{}/", create_id()),
            record_prefix: format!("/{}/", create_id()),
            ..Self::default()
        }
    }

    /// Parse a TOML document, without environment overrides.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load and validate `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load `path`, or write a [`generated`](Self::generated) config there
    /// when it does not exist. The flag is `true` when a file was created.
    pub fn load_or_create(path: &Path) -> Result<(Self, bool), ConfigError> {
        if path.exists() {
            return Ok((Self::load(path)?, false));
        }
        let generated = Self::generated();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, generated.to_toml()?).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Wrote new configuration to {}", path.display());
        Ok((Self::load(path)?, true))
    }

    /// Replace the fields set in `overrides`, then validate again.
    pub fn apply(&mut self, overrides: ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(addr) = overrides.bind_addr {
            self.bind_addr = addr;
        }
        if let Some(folder) = overrides.recordings_folder {
            self.recordings_folder = folder;
        }
        if let Some(path) = overrides.activity_log {
            self.activity_log = Some(path);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, prefix) in [
            ("receiver_prefix", &self.receiver_prefix),
            ("record_prefix", &self.record_prefix),
        ] {
            if prefix.len() < 2 || !prefix.starts_with('/') || !prefix.ends_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "{name} must start and end with '/', got {prefix:?}"
                )));
            }
        }
        if self.receiver_prefix == self.record_prefix {
            return Err(ConfigError::Invalid(
                "receiver_prefix and record_prefix must differ".to_string(),
            ));
        }
        for path in self.emitter_paths.iter().chain(&self.admin_paths) {
            if path.is_empty() || !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "socket paths must start with '/', got {path:?}"
                )));
            }
        }
        if self.emitter_paths.is_empty() {
            return Err(ConfigError::Invalid("no emitter path configured".to_string()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn release_cooldown(&self) -> Duration {
        Duration::from_millis(self.release_cooldown_ms)
    }

    /// URL of the receiver page for `emitter_id`.
    pub fn receiver_url(&self, emitter_id: &str) -> String {
        let base = self.public_base_url.as_deref().unwrap_or("");
        format!("{}{}{emitter_id}", base.trim_end_matches('/'), self.receiver_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.release_cooldown(), Duration::from_millis(1000));
        config.validate().unwrap();
    }

    #[test]
    fn test_generated_paths_are_unguessable() {
        let a = ServerConfig::generated();
        let b = ServerConfig::generated();
        assert_ne!(a.emitter_paths, b.emitter_paths);
        assert_ne!(a.receiver_prefix, a.record_prefix);
        assert!(a.emitter_paths[0].len() > 40);
        a.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            bind_addr = "0.0.0.0:9000"
            record = true
            emitter_paths = ["/cam1/", "/cam2/"]

            [rtc_configuration]
            iceServers = [{ urls = "stun:stun.example.org" }]
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert!(config.record);
        assert_eq!(config.emitter_paths.len(), 2);
        assert_eq!(config.receiver_prefix, "/receiver/");
        assert_eq!(
            config.rtc_configuration["iceServers"][0]["urls"],
            "stun:stun.example.org"
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ServerConfig::from_toml("listen_port = 8080").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let err = ServerConfig::from_toml(r#"receiver_prefix = "receiver""#).unwrap_err();
        assert!(err.to_string().contains("receiver_prefix"), "{err}");
    }

    #[test]
    fn test_overrides_replace_only_given_fields() {
        let mut config = ServerConfig::default();
        config
            .apply(ConfigOverrides {
                bind_addr: Some("0.0.0.0:1234".to_string()),
                recordings_folder: Some(PathBuf::from("/srv/rec")),
                ..ConfigOverrides::default()
            })
            .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:1234");
        assert_eq!(config.recordings_folder, PathBuf::from("/srv/rec"));
        assert_eq!(config.activity_log, None);
        assert_eq!(config.emitter_paths, ServerConfig::default().emitter_paths);

        config.apply(ConfigOverrides::default()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:1234");
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ServerConfig::generated();
        let text = config.to_toml().unwrap();
        assert_eq!(ServerConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_load_or_create_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("castlink.toml");
        let (first, created) = ServerConfig::load_or_create(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        let (second, created) = ServerConfig::load_or_create(&path).unwrap();
        assert!(!created);
        assert_eq!(first.emitter_paths, second.emitter_paths);
    }

    #[test]
    fn test_receiver_url() {
        let config = ServerConfig {
            public_base_url: Some("https://relay.example.org/".into()),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.receiver_url("abc"),
            "https://relay.example.org/receiver/abc"
        );
    }
}
