//! Configuration for the profiler collector.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PROFILER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/profiler/collector.toml
//!   3. ~/.config/profiler/collector.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DEFAULT_PROTOCOL_VERSION;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address agents connect to.
    pub bind: String,
    /// Local HTTP port for the status API. 0 = disabled.
    pub status_port: u16,
    pub connect_timeout_ms: u64,
    /// Deadline applied to every socket read.
    pub read_timeout_ms: u64,
    /// Deadline applied to every socket write and flush.
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Version returned to agents in the handshake.
    pub server_version: i64,
    /// Rotation period handed to agents for rotating streams.
    pub rotation_period_ms: i64,
    /// Rotation size handed to agents for rotating streams.
    pub rotation_size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// When set, every finished pod is written here, one file per chunk.
    pub dump_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset.
    pub level: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1715".into(),
            status_port: 9715,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            server_version: DEFAULT_PROTOCOL_VERSION,
            rotation_period_ms: 300_000,
            rotation_size: 209_715_200, // 200 MB
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("profiler")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CollectorConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            CollectorConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PROFILER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("collector.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CollectorConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PROFILER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PROFILER_NETWORK__BIND") {
            self.network.bind = v;
        }
        parse_into(&lookup, "PROFILER_NETWORK__STATUS_PORT", &mut self.network.status_port);
        parse_into(&lookup, "PROFILER_NETWORK__CONNECT_TIMEOUT_MS", &mut self.network.connect_timeout_ms);
        parse_into(&lookup, "PROFILER_NETWORK__READ_TIMEOUT_MS", &mut self.network.read_timeout_ms);
        parse_into(&lookup, "PROFILER_NETWORK__WRITE_TIMEOUT_MS", &mut self.network.write_timeout_ms);
        parse_into(&lookup, "PROFILER_PROTOCOL__SERVER_VERSION", &mut self.protocol.server_version);
        parse_into(&lookup, "PROFILER_PROTOCOL__ROTATION_PERIOD_MS", &mut self.protocol.rotation_period_ms);
        parse_into(&lookup, "PROFILER_PROTOCOL__ROTATION_SIZE", &mut self.protocol.rotation_size);
        if let Some(v) = lookup("PROFILER_STORAGE__DUMP_DIR") {
            self.storage.dump_dir = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = lookup("PROFILER_LOGGING__LEVEL") {
            self.logging.level = v;
        }
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = lookup(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparsable override"),
        }
    }
}
