use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use mesh_core::config::{HealthCheckConfig, RegistryConfig, RetryConfig};
use mesh_services::{
    ConsulRegistry, Discoverer, Registrar, Registration, Registry, RegistryError, RetryPolicy,
    ServiceInstance, TransportKind,
};

use crate::{fast_retry, spawn_agent};

fn connector_instance(address: &str, port: u16, ordinal: u32) -> ServiceInstance {
    ServiceInstance::new(
        address,
        port,
        TransportKind::Socket.namespaced("Connector"),
        ordinal,
    )
}

#[tokio::test]
async fn register_discover_deregister_round_trip() -> Result<()> {
    let (agent, addr) = spawn_agent().await?;
    let retry = fast_retry();
    let config = agent.registry_config(addr);
    let registry: Arc<dyn Registry> =
        Arc::new(ConsulRegistry::connect(&config, &RetryPolicy::connect(&retry)).await?);

    let (shutdown_tx, _) = broadcast::channel(1);
    let registrar = Registrar::new(registry.clone(), &retry);
    let mut handles = Vec::new();
    for (address, ordinal) in [("10.0.0.6", 2), ("10.0.0.5", 1), ("10.0.0.6", 1)] {
        let registration = Registration::for_instance(
            connector_instance(address, 9001, ordinal),
            &HealthCheckConfig::default(),
        );
        handles.push(registrar.register(registration, shutdown_tx.subscribe()).await?);
    }

    let body = agent.with(|s| s.services["10.0.0.5:9001-<Socket>Connector-1"].clone());
    assert_eq!(body["Name"], "<Socket>Connector");
    assert_eq!(body["Check"]["TCP"], "10.0.0.5:9001");
    assert_eq!(body["Check"]["Interval"], "3s");
    assert_eq!(body["Check"]["DeregisterCriticalServiceAfter"], "10s");

    let discoverer = Discoverer::new(registry.clone(), &config, &retry);
    let endpoints = discoverer.discover("<Socket>Connector").await;
    assert_eq!(
        endpoints,
        vec!["10.0.0.5:9001", "10.0.0.6:9001", "10.0.0.6:9001"]
    );

    agent.with(|s| s.kv.insert("FilterServices".into(), "10.0.0.6;".into()));
    assert_eq!(
        discoverer.discover("<Socket>Connector").await,
        vec!["10.0.0.5:9001"]
    );

    shutdown_tx.send(())?;
    for handle in handles {
        handle.finished().await;
    }
    agent.with(|s| {
        assert!(s.services.is_empty());
        assert_eq!(s.deregistrations.len(), 3);
    });
    Ok(())
}

#[tokio::test]
async fn fully_excluded_service_discovers_nothing() -> Result<()> {
    let (agent, addr) = spawn_agent().await?;
    let retry = fast_retry();
    let config = agent.registry_config(addr);
    let registry = Arc::new(ConsulRegistry::new(&config)?);

    registry
        .register(&Registration::for_instance(
            connector_instance("10.0.0.5", 9001, 1),
            &HealthCheckConfig::default(),
        ))
        .await?;
    agent.with(|s| s.kv.insert("FilterServices".into(), " 10.0.0.5 ;".into()));

    let discoverer = Discoverer::new(registry, &config, &retry);
    assert!(discoverer.discover("<Socket>Connector").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn missing_exclusion_key_filters_nothing() -> Result<()> {
    let (agent, addr) = spawn_agent().await?;
    let config = agent.registry_config(addr);
    let registry = ConsulRegistry::new(&config)?;

    assert_eq!(registry.kv_get("FilterServices").await?, None);
    agent.with(|s| s.kv.insert("FilterServices".into(), "10.0.0.9;".into()));
    assert_eq!(
        registry.kv_get("FilterServices").await?.as_deref(),
        Some("10.0.0.9;")
    );
    Ok(())
}

#[tokio::test]
async fn token_is_sent_with_every_request() -> Result<()> {
    let (agent, addr) = spawn_agent().await?;
    let config = RegistryConfig {
        token: Some("secret".into()),
        ..agent.registry_config(addr)
    };
    let registry = ConsulRegistry::new(&config)?;
    registry.ping().await?;
    registry
        .register(&Registration::for_instance(
            connector_instance("10.0.0.5", 9001, 1),
            &HealthCheckConfig::default(),
        ))
        .await?;
    agent.with(|s| assert_eq!(s.tokens, vec!["secret", "secret"]));
    Ok(())
}

#[tokio::test]
async fn unreachable_registry_is_unavailable() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let retry = RetryConfig {
        connect_attempts: 3,
        ..fast_retry()
    };
    let config = RegistryConfig {
        address: format!("http://{addr}"),
        ..RegistryConfig::default()
    };
    let err = ConsulRegistry::connect(&config, &RetryPolicy::connect(&retry))
        .await
        .err()
        .expect("connect should fail");
    assert!(matches!(err, RegistryError::Unavailable { attempts: 3, .. }));
    Ok(())
}
