//! Application configuration
//!
//! Loaded from a TOML file; every field has a default so a partial (or
//! missing) file is fine. Device settings edited from the web UI are
//! separate and live in [`crate::settings`].

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub buffer: BufferConfig,
    pub upload: UploadConfig,
    pub relay: RelayConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Parse configuration text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from `path`, creating it with defaults when absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let config = Self::load(path)?;
            tracing::info!("Loaded configuration from {}", path.display());
            Ok(config)
        } else {
            tracing::info!("No configuration at {}, writing defaults", path.display());
            let config = Self::default();
            if let Err(e) = config.save(path) {
                tracing::warn!("Could not write default configuration: {}", e);
            }
            Ok(config)
        }
    }

    /// Write to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Default configuration file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "radiorelay", "lan-radio-relay")
            .map(|dirs| dirs.config_dir().join("relay.toml"))
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(Error::Config("server.max_connections must be at least 1".into()));
        }
        if self.server.packet_size < 256 {
            return Err(Error::Config("server.packet_size must be at least 256".into()));
        }
        if self.buffer.slot_size == 0 {
            return Err(Error::Config("buffer.slot_size must be non-zero".into()));
        }
        if self.buffer.read_lag + 1 >= self.buffer.slot_count {
            return Err(Error::Config(format!(
                "buffer.read_lag ({}) must be smaller than buffer.slot_count - 1 ({})",
                self.buffer.read_lag,
                self.buffer.slot_count.saturating_sub(1)
            )));
        }
        if self.upload.max_boundary_length == 0 || self.upload.max_filename_length == 0 {
            return Err(Error::Config("upload limits must be non-zero".into()));
        }
        Ok(())
    }
}

/// HTTP/WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub http_port: u16,
    pub max_connections: usize,
    /// Idle time before an unclassified connection is evicted
    pub idle_timeout_ms: u64,
    /// Sleep between loop ticks
    pub tick_interval_ms: u64,
    /// Request scratch buffer size
    pub packet_size: usize,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address: {}", e)))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            max_connections: MAX_CONNECTIONS,
            idle_timeout_ms: IDLE_TIMEOUT_MS,
            tick_interval_ms: 5,
            packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Audio ring buffer geometry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    pub slot_count: usize,
    pub slot_size: usize,
    pub read_lag: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            slot_count: RING_SLOT_COUNT,
            slot_size: RING_SLOT_SIZE,
            read_lag: RING_READ_LAG,
        }
    }
}

/// Multipart upload limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Extra waits for body bytes after the first read
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub max_filename_length: usize,
    pub max_boundary_length: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            retries: UPLOAD_RETRIES,
            retry_delay_ms: UPLOAD_RETRY_DELAY_MS,
            max_filename_length: MAX_FILENAME_LENGTH,
            max_boundary_length: MAX_BOUNDARY_LENGTH,
        }
    }
}

/// Icecast relay behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Keep a relay connection up whatever the startup mode
    pub enabled: bool,
    pub reply_polls: u32,
    pub reply_poll_delay_ms: u64,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub listen_header_timeout_ms: u64,
    pub stream_name: String,
    pub stream_description: String,
    pub stream_url: String,
    pub stream_genre: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reply_polls: ICY_REPLY_POLLS,
            reply_poll_delay_ms: ICY_POLL_DELAY_MS,
            reconnect_delay_ms: RELAY_RECONNECT_DELAY_MS,
            connect_timeout_ms: 5000,
            listen_header_timeout_ms: LISTEN_HEADER_TIMEOUT_MS,
            stream_name: "Radio Relay Stream".to_string(),
            stream_description: "Live stream from a radio relay appliance.".to_string(),
            stream_url: "http://localhost".to_string(),
            stream_genre: "Various".to_string(),
        }
    }
}

/// File storage and the demo audio producer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory served over HTTP and receiving uploads
    pub root: PathBuf,
    /// MP3 file (inside `root`) replayed into the ring buffer
    pub replay_file: Option<String>,
    pub replay_bitrate_kbps: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            replay_file: None,
            replay_bitrate_kbps: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml("[server]\nhttp_port = 8080\n\n[relay]\nenabled = true\n").unwrap();
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.max_connections, MAX_CONNECTIONS);
        assert!(config.relay.enabled);
        assert_eq!(config.buffer, BufferConfig::default());
    }

    #[test]
    fn test_invalid_lag_rejected() {
        let err = AppConfig::from_toml("[buffer]\nslot_count = 3\nread_lag = 2\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_missing_file_gets_defaults_written() {
        let dir = std::env::temp_dir().join(format!("relay-config-{}", std::process::id()));
        let path = dir.join("relay.toml");
        let _ = std::fs::remove_dir_all(&dir);

        let config = AppConfig::load_or_default(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(AppConfig::load(&path).unwrap(), config);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_socket_addr() {
        let config = ServerConfig {
            bind_address: "127.0.0.1".into(),
            http_port: 9000,
            ..ServerConfig::default()
        };
        assert_eq!(config.socket_addr().unwrap().port(), 9000);
    }
}
