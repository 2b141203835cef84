//! Configuration system for mesh services.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/mesh/config.toml
//!   3. ~/.config/mesh/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub service: ServiceConfig,
    pub registry: RegistryConfig,
    pub health: HealthCheckConfig,
    pub retry: RetryConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
}

/// The local instance this process registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Logical service name, before any transport tag is applied.
    pub name: String,
    /// Address other services use to reach this one.
    pub address: String,
    pub port: u16,
    /// Instance ordinal; the last segment of the instance id.
    pub ordinal: u32,
    /// Transport tag ("Socket" / "WebSocket"). None = untagged name.
    pub transport: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// Remote health-checked registry reached over HTTP.
    Consul,
    /// In-process registry; single-node runs and tests.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    /// Base URL of the registry agent.
    pub address: String,
    /// ACL token sent with every registry request.
    pub token: Option<String>,
    /// Key holding the `;`-delimited list of excluded addresses.
    pub exclusion_key: String,
    pub request_timeout_ms: u64,
}

/// TCP health probe the registry runs against every registered instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub timeout_secs: u64,
    pub interval_secs: u64,
    /// Continuous probe failure for this long removes the instance.
    pub deregister_after_secs: u64,
}

/// Attempt bounds and fixed backoff for registry operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub connect_attempts: u32,
    pub register_attempts: u32,
    pub deregister_attempts: u32,
    pub discovery_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub heartbeat_ms: u64,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset.
    pub filter: String,
    /// Global cap on accepted log records per second. 0 = unlimited.
    pub max_records_per_sec: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    /// Service whose endpoints the connector lookup returns.
    pub connector_service: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "Api".to_string(),
            address: "127.0.0.1".to_string(),
            port: 18881,
            ordinal: 1,
            transport: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Consul,
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            exclusion_key: "FilterServices".to_string(),
            request_timeout_ms: 5000,
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1,
            interval_secs: 3,
            deregister_after_secs: 10,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            register_attempts: 5,
            deregister_attempts: 3,
            discovery_attempts: 10,
            backoff_ms: 1000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 2000,
            reconnect_delay_ms: 3000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            max_records_per_sec: 100,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 18881,
            connector_service: "Connector".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl SessionConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl RegistryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("mesh")
}

fn home_dir() -> PathBuf {
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

impl MeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MESH_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MESH_SERVICE__ADDRESS") {
            self.service.address = v;
        }
        if let Some(p) = lookup("MESH_SERVICE__PORT").and_then(|v| v.parse().ok()) {
            self.service.port = p;
        }
        if let Some(n) = lookup("MESH_SERVICE__ORDINAL").and_then(|v| v.parse().ok()) {
            self.service.ordinal = n;
        }
        if let Some(v) = lookup("MESH_REGISTRY__ADDRESS") {
            self.registry.address = v;
        }
        match lookup("MESH_REGISTRY__BACKEND").as_deref() {
            Some("consul") => self.registry.backend = RegistryBackend::Consul,
            Some("memory") => self.registry.backend = RegistryBackend::Memory,
            _ => {}
        }
        if let Some(v) = lookup("MESH_REGISTRY__TOKEN") {
            self.registry.token = Some(v);
        }
        if let Some(p) = lookup("MESH_API__PORT").and_then(|v| v.parse().ok()) {
            self.api.port = p;
        }
        if let Some(v) = lookup("MESH_LOG") {
            self.logging.filter = v;
        }
    }
}
