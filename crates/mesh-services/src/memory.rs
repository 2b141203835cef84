//! In-process registry backend.
//!
//! Every registered instance counts as healthy; there is no probing. Useful
//! for single-node runs and as a test double for the remote registry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::registry::{Registration, Registry, RegistryError, ServiceInstance};

#[derive(Clone, Default)]
pub struct MemoryRegistry {
    instances: Arc<DashMap<String, ServiceInstance>>,
    kv: Arc<DashMap<String, String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_kv(&self, key: impl Into<String>, value: impl Into<String>) {
        self.kv.insert(key.into(), value.into());
    }

    /// Insert an instance directly, bypassing registration.
    pub fn insert(&self, instance: ServiceInstance) {
        self.instances.insert(instance.id.clone(), instance);
    }

}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn ping(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn register(&self, registration: &Registration) -> Result<(), RegistryError> {
        tracing::debug!(id = %registration.instance.id, "registering in memory");
        self.insert(registration.instance.clone());
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        self.instances.remove(id);
        Ok(())
    }

    async fn healthy_instances(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        Ok(self
            .instances
            .iter()
            .filter(|entry| entry.name == name)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, RegistryError> {
        Ok(self.kv.get(key).map(|v| v.value().clone()))
    }
}
