//! Configuration module
//!
//! Handles loading and saving CoreRPC configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::ServerConfig;
use crate::protocol::{CodecType, Options, DEFAULT_PORT, MAX_FRAME_SIZE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Client settings
    #[serde(default)]
    pub client: ClientSettings,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log filter directive, e.g. `corerpc=debug` (overrides `verbose`)
    pub log_filter: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Time allowed for a new connection's handshake (ms)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Largest header or body accepted
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            handshake_timeout_ms: default_handshake_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Codec negotiated with the server
    #[serde(default)]
    pub codec: CodecType,
    /// Connection timeout (ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Per-call deadline (ms); calls wait indefinitely when unset
    pub call_timeout_ms: Option<u64>,
    /// Largest header or body accepted
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_connect_timeout() -> u64 {
    10_000
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            codec: CodecType::default(),
            connect_timeout_ms: default_connect_timeout(),
            call_timeout_ms: None,
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ServerSettings {
    /// Address to bind the listener to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_frame_size: self.max_frame_size,
        }
    }
}

impl ClientSettings {
    pub fn options(&self) -> Options {
        Options::new(self.codec)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_max_frame_size(self.max_frame_size)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("corerpc/config.toml")),
            Some(PathBuf::from("./corerpc.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        server: ServerSettings {
            bind_address: "0.0.0.0".to_string(),
            ..Default::default()
        },
        client: ClientSettings {
            codec: CodecType::Json,
            call_timeout_ms: Some(5_000),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
