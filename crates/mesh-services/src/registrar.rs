//! Service registrar — publishes the local instance and retracts it on shutdown.
//!
//! Registration arms a background task that waits on the supervisor's
//! shutdown broadcast and then deregisters exactly once. Deregistration
//! failure is logged and swallowed: it must never take down a process that
//! is already on its way out.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;

use mesh_core::config::RetryConfig;

use crate::registry::{Registration, Registry, RegistryError};
use crate::retry::RetryPolicy;

pub struct Registrar {
    registry: Arc<dyn Registry>,
    register_policy: RetryPolicy,
    deregister_policy: RetryPolicy,
}

/// A live registration. Await `finished` during controlled shutdown so the
/// process does not exit before the registry has been told.
#[derive(Debug)]
pub struct RegistrationHandle {
    id: String,
    task: JoinHandle<()>,
}

impl RegistrationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the deregistration task to complete.
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(id = %self.id, error = %e, "deregistration task did not complete");
        }
    }
}

impl Registrar {
    pub fn new(registry: Arc<dyn Registry>, config: &RetryConfig) -> Self {
        Self::with_policies(
            registry,
            RetryPolicy::register(config),
            RetryPolicy::deregister(config),
        )
    }

    pub fn with_policies(
        registry: Arc<dyn Registry>,
        register_policy: RetryPolicy,
        deregister_policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            register_policy,
            deregister_policy,
        }
    }

    /// Register with retry, then arm deregistration on `shutdown`.
    ///
    /// Subscribe `shutdown` before calling: a signal sent while the retry loop
    /// is still running is buffered and honored once the loop ends, whether
    /// registration succeeded or was abandoned.
    pub async fn register(
        &self,
        registration: Registration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<RegistrationHandle, RegistryError> {
        let id = registration.instance.id.clone();

        let result = self
            .register_policy
            .run("service register", |_| self.registry.register(&registration))
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    id = %id,
                    name = %registration.instance.name,
                    endpoint = %registration.instance.endpoint(),
                    "service registered"
                );
                let task = tokio::spawn(deregister_on_shutdown(
                    self.registry.clone(),
                    self.deregister_policy,
                    id.clone(),
                    shutdown,
                ));
                Ok(RegistrationHandle { id, task })
            }
            Err(exhausted) => {
                tracing::error!(
                    id = %id,
                    error = %exhausted.last,
                    attempts = exhausted.attempts,
                    "service registration abandoned"
                );
                if shutdown_requested(&mut shutdown) {
                    // An attempt may have landed despite reporting failure.
                    if let Err(e) = self.deregister(&id).await {
                        tracing::error!(error = %e, "failed to deregister abandoned registration");
                    }
                }
                Err(RegistryError::RegistrationFailed {
                    id,
                    attempts: exhausted.attempts,
                    reason: exhausted.last.to_string(),
                })
            }
        }
    }

    /// Deregister with the deregistration retry bound.
    pub async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        deregister_with(self.registry.as_ref(), &self.deregister_policy, id).await
    }
}

async fn deregister_with(
    registry: &dyn Registry,
    policy: &RetryPolicy,
    id: &str,
) -> Result<(), RegistryError> {
    policy
        .run("service deregister", |_| registry.deregister(id))
        .await
        .map_err(|e| RegistryError::DeregistrationFailed {
            id: id.to_string(),
            attempts: e.attempts,
            reason: e.last.to_string(),
        })?;
    tracing::info!(id, "service deregistered");
    Ok(())
}

async fn deregister_on_shutdown(
    registry: Arc<dyn Registry>,
    policy: RetryPolicy,
    id: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    // A closed channel means the supervisor is gone; treat it as shutdown.
    let _ = shutdown.recv().await;
    tracing::info!(id = %id, "shutdown requested, deregistering service");

    if let Err(e) = deregister_with(registry.as_ref(), &policy, &id).await {
        tracing::error!(error = %e, "failed to deregister service after all retries");
    }
}

fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}
