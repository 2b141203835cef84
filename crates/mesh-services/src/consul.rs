//! Consul agent backend — the registry spoken over its HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};

use mesh_core::config::RegistryConfig;

use crate::registry::{Registration, Registry, RegistryError, ServiceInstance};
use crate::retry::RetryPolicy;

pub struct ConsulRegistry {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ConsulRegistry {
    /// Build a client without touching the network.
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let base = Url::parse(&config.address)
            .map_err(|e| RegistryError::InvalidAddress(format!("{}: {e}", config.address)))?;
        if base.cannot_be_a_base() {
            return Err(RegistryError::InvalidAddress(config.address.clone()));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base,
            token: config.token.clone(),
        })
    }

    /// Build a client and wait until the agent answers, within `policy`.
    pub async fn connect(config: &RegistryConfig, policy: &RetryPolicy) -> Result<Self, RegistryError> {
        let registry = Self::new(config)?;
        policy
            .run("registry connect", |_| registry.ping())
            .await
            .map_err(|e| RegistryError::Unavailable {
                attempts: e.attempts,
                reason: e.last.to_string(),
            })?;
        tracing::info!(address = %registry.base, "connected to registry");
        Ok(registry)
    }

    /// `{base}/v1/{segments...}`, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("v1").extend(segments);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&AgentServiceRegistration<'_>>,
    ) -> Result<reqwest::Response, RegistryError> {
        let path = url.path().to_string();
        let mut request = self.http.request(method, url);
        if let Some(ref token) = self.token {
            request = request.header("X-Consul-Token", token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| RegistryError::Transport(format!("{path}: {e}")))
    }

    fn check_status(response: &reqwest::Response) -> Result<(), RegistryError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RegistryError::Status {
                status: response.status().as_u16(),
                path: response.url().path().to_string(),
            })
        }
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn ping(&self) -> Result<(), RegistryError> {
        let response = self.send(Method::GET, self.url(&["agent", "self"]), None).await?;
        Self::check_status(&response)
    }

    async fn register(&self, registration: &Registration) -> Result<(), RegistryError> {
        let body = AgentServiceRegistration::from(registration);
        let url = self.url(&["agent", "service", "register"]);
        let response = self.send(Method::PUT, url, Some(&body)).await?;
        Self::check_status(&response)
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let url = self.url(&["agent", "service", "deregister", id]);
        let response = self.send(Method::PUT, url, None).await?;
        Self::check_status(&response)
    }

    async fn healthy_instances(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let mut url = self.url(&["health", "service", name]);
        url.query_pairs_mut().append_pair("passing", "true");

        let response = self.send(Method::GET, url, None).await?;
        Self::check_status(&response)?;
        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;

        Ok(entries
            .into_iter()
            .map(|entry| ServiceInstance {
                id: entry.service.id,
                name: entry.service.service,
                address: entry.service.address,
                port: entry.service.port,
            })
            .collect())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, RegistryError> {
        let mut url = self.url(&["kv", key]);
        url.set_query(Some("raw"));

        let response = self.send(Method::GET, url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check_status(&response)?;
        let text = response
            .text()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(Some(text))
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: &'a [String],
    #[serde(rename = "Check")]
    check: AgentServiceCheck,
}

#[derive(Debug, Serialize)]
struct AgentServiceCheck {
    #[serde(rename = "TCP")]
    tcp: String,
    #[serde(rename = "Timeout")]
    timeout: String,
    #[serde(rename = "Interval")]
    interval: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

impl<'a> From<&'a Registration> for AgentServiceRegistration<'a> {
    fn from(reg: &'a Registration) -> Self {
        Self {
            id: &reg.instance.id,
            name: &reg.instance.name,
            address: &reg.instance.address,
            port: reg.instance.port,
            tags: &reg.tags,
            check: AgentServiceCheck {
                tcp: reg.check.target.clone(),
                timeout: go_duration(reg.check.timeout),
                interval: go_duration(reg.check.interval),
                deregister_critical_service_after: go_duration(reg.check.deregister_after),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: AgentService,
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

/// Duration in the agent's `1s` / `500ms` notation.
fn go_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
