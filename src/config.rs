//! Application configuration
//!
//! Loaded from TOML. Missing files and missing keys fall back to defaults so a
//! fresh install runs without any config on disk.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::StreamParams;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub api: ApiConfig,
    pub inventory: InventoryConfig,
}

/// Inbound WebSocket listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    pub handshake_timeout_ms: u64,
    /// Output device new inbound clients are routed to
    pub default_output: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_WS_PORT,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            default_output: None,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Outbound links to remote servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    /// How long teardown waits for the transport task before aborting it
    pub close_grace_ms: u64,
    pub stream: StreamParams,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
            stream: StreamParams::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// HTTP control API consumed by the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
    pub http_port: u16,
    pub permissive_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_API_PORT,
            permissive_cors: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Zero disables periodic re-enumeration
    pub refresh_interval_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
        }
    }
}

impl InventoryConfig {
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

impl AppConfig {
    /// Default location, e.g. `~/.config/remoteio/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "remoteio").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from [`AppConfig::default_path`] when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!("Loading config from {}", path.display());
                Self::from_toml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [server]
            port = 9100
            default_output = "Speakers"

            [client]
            connect_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.default_output.as_deref(), Some("Speakers"));
        assert_eq!(config.client.connect_timeout(), Duration::from_millis(250));
        assert_eq!(config.api, ApiConfig::default());
        assert_eq!(config.client.stream, StreamParams::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = AppConfig::from_toml("[server]\nport = \"nope\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.inventory.refresh_interval_secs = 0;
        config.api.http_port = 3100;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.inventory.refresh_interval(), None);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }
}
