use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use mesh_api::ApiState;
use mesh_core::config::RegistryConfig;
use mesh_services::{Discoverer, MemoryRegistry, ServiceInstance};

use crate::fast_retry;

async fn get_connectors(base: &str, query: &str) -> Result<Vec<String>> {
    let endpoints = reqwest::get(format!("{base}/GetConnector{query}"))
        .await?
        .error_for_status()?
        .json::<Vec<String>>()
        .await?;
    Ok(endpoints)
}

#[tokio::test]
async fn gateway_serves_connector_lookups_until_shutdown() -> Result<()> {
    let registry = MemoryRegistry::new();
    registry.insert(ServiceInstance::new("10.0.0.8", 9001, "<Socket>Connector", 2));
    registry.insert(ServiceInstance::new("10.0.0.8", 9000, "<Socket>Connector", 1));
    registry.insert(ServiceInstance::new("10.0.0.9", 9002, "<WebSocket>Connector", 1));

    let state = ApiState {
        discoverer: Arc::new(Discoverer::new(
            Arc::new(registry),
            &RegistryConfig::default(),
            &fast_retry(),
        )),
        connector_service: "Connector".into(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(mesh_api::serve_on(listener, state, shutdown_rx));

    assert_eq!(
        get_connectors(&base, "?type=Socket").await?,
        vec!["10.0.0.8:9000", "10.0.0.8:9001"]
    );
    assert_eq!(
        get_connectors(&base, "?type=WebSocket").await?,
        vec!["10.0.0.9:9002"]
    );
    assert!(get_connectors(&base, "?type=Carrier").await?.is_empty());
    assert!(get_connectors(&base, "").await?.is_empty());

    shutdown_tx.send(())?;
    server.await??;
    Ok(())
}
