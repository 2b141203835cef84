//! Registry model — instances, health checks, and the backend contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mesh_core::config::{HealthCheckConfig, RegistryBackend, RegistryConfig, RetryConfig};

use crate::consul::ConsulRegistry;
use crate::memory::MemoryRegistry;
use crate::retry::RetryPolicy;

/// Transport a connector-class service speaks. Used to namespace service names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Socket,
    WebSocket,
}

impl TransportKind {
    /// Accepts exactly "Socket" or "WebSocket".
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Socket" => Some(Self::Socket),
            "WebSocket" => Some(Self::WebSocket),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socket => "Socket",
            Self::WebSocket => "WebSocket",
        }
    }

    /// `<Socket>Connector` style registry name.
    pub fn namespaced(&self, service: &str) -> String {
        format!("<{}>{}", self.as_str(), service)
    }
}

/// One registered process. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// `address:port-name-ordinal`
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl ServiceInstance {
    pub fn new(address: impl Into<String>, port: u16, name: impl Into<String>, ordinal: u32) -> Self {
        let address = address.into();
        let name = name.into();
        Self {
            id: format!("{address}:{port}-{name}-{ordinal}"),
            name,
            address,
            port,
        }
    }

    /// `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Third dash-delimited segment of the id. None for ids not shaped
    /// `address:port-name-ordinal`.
    pub fn ordinal(&self) -> Option<&str> {
        self.id.split('-').nth(2)
    }

    /// Discovery ordering key: `address-ordinal`.
    pub fn sort_key(&self) -> Option<String> {
        self.ordinal().map(|ordinal| format!("{}-{}", self.address, ordinal))
    }
}

/// TCP reachability probe attached to a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// `address:port` the registry dials.
    pub target: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub deregister_after: Duration,
}

impl HealthCheck {
    pub fn tcp(target: impl Into<String>, config: &HealthCheckConfig) -> Self {
        Self {
            target: target.into(),
            timeout: Duration::from_secs(config.timeout_secs),
            interval: Duration::from_secs(config.interval_secs),
            deregister_after: Duration::from_secs(config.deregister_after_secs),
        }
    }
}

/// Everything sent in one register call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub instance: ServiceInstance,
    pub check: HealthCheck,
    pub tags: Vec<String>,
}

impl Registration {
    /// Registration probing the instance's own endpoint, tagged with its name.
    pub fn for_instance(instance: ServiceInstance, health: &HealthCheckConfig) -> Self {
        let check = HealthCheck::tcp(instance.endpoint(), health);
        let tags = vec![instance.name.clone()];
        Self {
            instance,
            check,
            tags,
        }
    }
}

/// Remote health-checked key/instance store.
///
/// Implementations must be safe for concurrent use; callers share one handle.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), RegistryError>;

    async fn register(&self, registration: &Registration) -> Result<(), RegistryError>;

    async fn deregister(&self, id: &str) -> Result<(), RegistryError>;

    /// Instances of `name` currently passing their health checks, unordered.
    async fn healthy_instances(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError>;

    /// Raw value under `key`, None if absent.
    async fn kv_get(&self, key: &str) -> Result<Option<String>, RegistryError>;
}

/// Open the configured backend. The remote backend is probed with `retry`'s
/// connect bound before it is handed out.
pub async fn open(
    config: &RegistryConfig,
    retry: &RetryConfig,
) -> Result<Arc<dyn Registry>, RegistryError> {
    match config.backend {
        RegistryBackend::Consul => {
            let registry = ConsulRegistry::connect(config, &RetryPolicy::connect(retry)).await?;
            Ok(Arc::new(registry))
        }
        RegistryBackend::Memory => {
            tracing::warn!("using in-process registry; instances are not shared between processes");
            Ok(Arc::new(MemoryRegistry::new()))
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("registry unavailable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("registration of {id} failed after {attempts} attempts: {reason}")]
    RegistrationFailed {
        id: String,
        attempts: u32,
        reason: String,
    },

    #[error("deregistration of {id} failed after {attempts} attempts: {reason}")]
    DeregistrationFailed {
        id: String,
        attempts: u32,
        reason: String,
    },

    #[error("registry transport error: {0}")]
    Transport(String),

    #[error("registry returned HTTP {status} for {path}")]
    Status { status: u16, path: String },

    #[error("failed to decode registry response: {0}")]
    Decode(String),

    #[error("invalid registry address: {0}")]
    InvalidAddress(String),
}
