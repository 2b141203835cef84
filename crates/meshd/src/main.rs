//! meshd — API gateway service: registers itself, serves connector lookups.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use mesh_api::ApiState;
use mesh_core::config::MeshConfig;
use mesh_services::{
    registry, telemetry, Discoverer, Registrar, Registration, Registry, ServiceInstance,
    TransportKind,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Config first so the log filter and rate limit come from it.
    let written = MeshConfig::write_default_if_missing();
    let loaded = MeshConfig::load();
    let config = loaded.as_ref().cloned().unwrap_or_default();

    telemetry::init(&config.logging).context("failed to install log subscriber")?;
    if let Err(e) = written {
        tracing::warn!(error = %e, "failed to write default config");
    }
    if let Err(e) = loaded {
        tracing::warn!(error = %e, "failed to load config, using defaults");
    }

    let registry = registry::open(&config.registry, &config.retry)
        .await
        .context("registry unavailable")?;

    run(config, registry, wait_for_signal()).await
}

/// Bind, register, serve until `signal` resolves or the API fails, then
/// deregister. An API failure is returned after deregistration completes.
async fn run<F>(config: MeshConfig, registry: Arc<dyn Registry>, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let service_name = match config.service.transport.as_deref() {
        Some(tag) => TransportKind::parse(tag)
            .with_context(|| format!("unknown transport tag {tag:?}"))?
            .namespaced(&config.service.name),
        None => config.service.name.clone(),
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    // Subscribed before any await so an early signal is not missed.
    let mut shutdown_rx = shutdown_tx.subscribe();
    let api_shutdown = shutdown_tx.subscribe();
    let registrar_shutdown = shutdown_tx.subscribe();

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            signal.await;
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Listener ─────────────────────────────────────────────────────────────
    // Bound before registering so the health check never targets a dead port.
    let listener = mesh_api::bind(config.api.port)
        .await
        .with_context(|| format!("failed to bind API port {}", config.api.port))?;
    let port = listener.local_addr()?.port();
    if port != config.service.port {
        tracing::warn!(
            configured = config.service.port,
            bound = port,
            "service port differs from the API port, registering the bound port"
        );
    }
    tracing::info!(
        service = %service_name,
        address = %config.service.address,
        port,
        "meshd starting"
    );

    // ── Self-registration ────────────────────────────────────────────────────
    let instance = ServiceInstance::new(
        config.service.address.clone(),
        port,
        service_name,
        config.service.ordinal,
    );
    let registration = Registration::for_instance(instance, &config.health);
    let registrar = Registrar::new(registry.clone(), &config.retry);
    let handle = registrar
        .register(registration, registrar_shutdown)
        .await
        .context("service registration failed")?;

    // ── API ──────────────────────────────────────────────────────────────────
    let state = ApiState {
        discoverer: Arc::new(Discoverer::new(registry, &config.registry, &config.retry)),
        connector_service: config.api.connector_service.clone(),
    };
    let mut api_task = tokio::spawn(mesh_api::serve_on(listener, state, api_shutdown));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let api_result = tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutting down");
            api_task.await
        }
        r = &mut api_task => {
            tracing::error!("API task exited early");
            let _ = shutdown_tx.send(());
            r
        }
    };

    handle.finished().await;
    tracing::info!("meshd stopped");
    api_result
        .context("API task panicked")?
        .context("API server failed")
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
