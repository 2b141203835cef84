//! Service discovery — healthy endpoints of a named service, in a stable order.
//!
//! Each poll re-reads the exclusion list so configuration changes apply on
//! the next call. An empty answer is retried on a fixed delay; once the
//! budget is spent the caller gets an empty list, never an error.

use std::sync::Arc;

use mesh_core::config::{RegistryConfig, RetryConfig};

use crate::registry::{Registry, ServiceInstance};
use crate::retry::RetryPolicy;

pub struct Discoverer {
    registry: Arc<dyn Registry>,
    policy: RetryPolicy,
    exclusion_key: String,
}

impl Discoverer {
    pub fn new(registry: Arc<dyn Registry>, registry_config: &RegistryConfig, retry: &RetryConfig) -> Self {
        Self::with_policy(
            registry,
            RetryPolicy::discovery(retry),
            registry_config.exclusion_key.clone(),
        )
    }

    pub fn with_policy(
        registry: Arc<dyn Registry>,
        policy: RetryPolicy,
        exclusion_key: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            policy,
            exclusion_key: exclusion_key.into(),
        }
    }

    /// `address:port` endpoints of healthy `service` instances, sorted by
    /// `address-ordinal`. Empty means "currently unavailable".
    pub async fn discover(&self, service: &str) -> Vec<String> {
        let result = self
            .policy
            .run("service discovery", |_| async move {
                let endpoints = self.poll(service).await;
                if endpoints.is_empty() {
                    Err("no healthy instances")
                } else {
                    Ok(endpoints)
                }
            })
            .await;

        match result {
            Ok(endpoints) => endpoints,
            Err(exhausted) => {
                tracing::error!(
                    service,
                    attempts = exhausted.attempts,
                    "unable to find service"
                );
                Vec::new()
            }
        }
    }

    /// One registry round: query, filter, order.
    async fn poll(&self, service: &str) -> Vec<String> {
        let instances = match self.registry.healthy_instances(service).await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(service, error = %e, "health query failed");
                return Vec::new();
            }
        };
        if instances.is_empty() {
            tracing::info!(service, "waiting for service registration");
            return Vec::new();
        }

        let excluded = match self.registry.kv_get(&self.exclusion_key).await {
            Ok(raw) => parse_exclusion_list(raw.as_deref().unwrap_or_default()),
            Err(e) => {
                tracing::warn!(key = %self.exclusion_key, error = %e, "exclusion list unreadable, not filtering");
                Vec::new()
            }
        };

        rank_endpoints(instances, &excluded)
    }
}

/// Parse a `;`-delimited address list, trimming entries and dropping empties.
pub fn parse_exclusion_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drop excluded addresses, order by `address-ordinal`, render endpoints.
///
/// Instances whose id lacks an ordinal segment are skipped with a warning
/// rather than failing the whole call.
pub fn rank_endpoints(instances: Vec<ServiceInstance>, excluded: &[String]) -> Vec<String> {
    let mut keyed: Vec<(String, ServiceInstance)> = instances
        .into_iter()
        .filter(|inst| !excluded.iter().any(|addr| *addr == inst.address))
        .filter_map(|inst| match inst.sort_key() {
            Some(key) => Some((key, inst)),
            None => {
                tracing::warn!(id = %inst.id, "instance id has no ordinal segment, skipping");
                None
            }
        })
        .collect();

    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, inst)| inst.endpoint()).collect()
}
